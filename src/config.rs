// Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "taskdesk-assistant";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Text of the sentinel greeting turn.
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Seconds before an HTTP request to the model server gives up.
    #[serde(default = "default_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_greeting() -> String {
    "Hi! I'm your project assistant. Ask me anything about your tasks.".to_string()
}

const fn default_timeout() -> u64 {
    600
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
            request_timeout: default_timeout(),
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Ollama(OllamaConfig),
    Scripted(ScriptedConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Ollama(OllamaConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "qwen3:4b".to_string(),
            system_prompt: None,
        }
    }
}

/// Offline backend with canned behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedConfig {
    /// Fixed reply; the last user turn is echoed when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default)]
    pub chunk_delay_ms: u64,
    #[serde(default)]
    pub load_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_load: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_chat: Option<String>,
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join(APP_DIR);

    fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

pub fn load_config() -> Result<AssistantConfig> {
    load_config_from(&get_config_path()?)
}

/// Loads `path`, writing the defaults there first if it does not exist yet.
pub fn load_config_from(path: &Path) -> Result<AssistantConfig> {
    if !path.exists() {
        let default_config = AssistantConfig::default();
        save_config_to(path, &default_config)?;
        return Ok(default_config);
    }

    let contents = fs::read_to_string(path).context("Failed to read config file")?;

    let config: AssistantConfig = toml::from_str(&contents).context("Failed to parse config file")?;

    Ok(config)
}

pub fn save_config_to(path: &Path, config: &AssistantConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(path, contents).context("Failed to write config file")?;

    Ok(())
}
