// Tracing subscriber setup, logging to stderr

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_DIRECTIVE: &str = "taskdesk_assistant=info";

/// `RUST_LOG` wins when set and valid; otherwise `fallback` is used.
pub fn build_filter(rust_log: Option<&str>, fallback: &str) -> Result<EnvFilter> {
    if let Some(directives) = rust_log.filter(|value| !value.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(fallback).with_context(|| format!("invalid log filter '{fallback}'"))
}

pub fn init(fallback: &str) -> Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(rust_log.as_deref(), fallback)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set subscriber: {e}"))?;

    Ok(())
}
