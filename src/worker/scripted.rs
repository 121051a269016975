// Deterministic in-process model: staged load, replies streamed one word at a time

use std::time::Duration;
use tracing::debug;

use super::Reporter;
use crate::config::ScriptedConfig;
use crate::error::WorkerError;
use crate::models::Role;
use crate::protocol::HistoryEntry;

const LOAD_STAGES: [(&str, f64); 3] = [("Fetching weights", 0.3), ("Compiling", 0.6), ("Ready", 1.0)];

#[derive(Debug)]
pub struct ScriptedModel {
    config: ScriptedConfig,
    /// Turns already consumed from the current conversation.
    seen_turns: usize,
}

impl ScriptedModel {
    pub async fn load(config: &ScriptedConfig, reporter: &Reporter) -> Result<Self, WorkerError> {
        for (stage, (text, fraction)) in LOAD_STAGES.iter().enumerate() {
            pause(config.load_delay_ms).await;
            reporter.progress(*text, *fraction);
            if stage == 0 {
                if let Some(message) = &config.fail_load {
                    return Err(WorkerError::Load(message.clone()));
                }
            }
        }

        Ok(Self {
            config: config.clone(),
            seen_turns: 0,
        })
    }

    pub async fn generate(
        &mut self,
        history: &[HistoryEntry],
        reporter: &Reporter,
    ) -> Result<(), WorkerError> {
        debug!(previously_seen = self.seen_turns, turns = history.len(), "scripted reply");
        self.seen_turns = history.len();
        let reply = self.reply_for(history);
        let chunks = chunk_words(&reply);
        if chunks.is_empty() {
            if let Some(message) = &self.config.fail_chat {
                return Err(WorkerError::Generation(message.clone()));
            }
        }

        for (index, chunk) in chunks.into_iter().enumerate() {
            pause(self.config.chunk_delay_ms).await;
            reporter.chunk(chunk);
            if index == 0 {
                if let Some(message) = &self.config.fail_chat {
                    return Err(WorkerError::Generation(message.clone()));
                }
            }
        }

        Ok(())
    }

    pub fn reset(&mut self) {
        self.seen_turns = 0;
    }

    #[cfg(test)]
    pub const fn seen_turns(&self) -> usize {
        self.seen_turns
    }

    fn reply_for(&self, history: &[HistoryEntry]) -> String {
        if let Some(reply) = &self.config.reply {
            return reply.clone();
        }
        history
            .iter()
            .rev()
            .find(|entry| entry.role == Role::User)
            .map_or_else(
                || "Nothing to echo yet.".to_string(),
                |entry| format!("You said: {}", entry.content),
            )
    }
}

async fn pause(millis: u64) {
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

/// Splits before every space that follows a non-space, so concatenating the
/// chunks gives back `text` exactly.
fn chunk_words(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    for (index, c) in text.char_indices() {
        if c == ' ' && index > start {
            chunks.push(&text[start..index]);
            start = index;
        }
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}
