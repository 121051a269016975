// Error types for the assistant runtime

use thiserror::Error;

use crate::models::{EngineState, TurnId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("turn {0} is still streaming")]
    AlreadyStreaming(TurnId),
}

#[derive(Debug, Error, PartialEq)]
pub enum ControllerError {
    #[error("assistant is not ready (state: {0})")]
    NotReady(EngineState),

    #[error("a reset is already in flight")]
    ResetPending,

    #[error("no worker is running")]
    WorkerUnavailable,

    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("model is not loaded")]
    NotLoaded,

    #[error("load failed: {0}")]
    Load(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

impl WorkerError {
    /// Message carried by the corresponding `load-error` / `chat-error` event.
    pub fn into_message(self) -> String {
        match self {
            Self::NotLoaded => "model is not loaded".to_string(),
            Self::Load(message) | Self::Generation(message) => message,
        }
    }
}
