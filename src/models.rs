use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Whether a turn is still receiving chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnStatus {
    Streaming,
    Complete,
    /// Generation failed; whatever content arrived before the failure is kept.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    pub status: TurnStatus,
    pub created_at: DateTime<Utc>,
    pub tokens: usize,
    /// Running word count of `content`, so a chunk costs only its own length.
    #[serde(skip)]
    words: usize,
}

impl Turn {
    pub fn new(role: Role, content: String) -> Self {
        let words = content.split_whitespace().count();
        Self {
            id: TurnId::new(),
            role,
            content,
            status: TurnStatus::Complete,
            created_at: Utc::now(),
            tokens: crate::tokens::message_tokens_for_words(words),
            words,
        }
    }

    /// Empty assistant turn that will accumulate streamed chunks.
    pub fn placeholder() -> Self {
        Self {
            status: TurnStatus::Streaming,
            ..Self::new(Role::Assistant, String::new())
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.status == TurnStatus::Streaming
    }

    pub fn push_chunk(&mut self, chunk: &str) {
        self.words += crate::tokens::words_added(&self.content, chunk);
        self.content.push_str(chunk);
        self.tokens = crate::tokens::message_tokens_for_words(self.words);
    }
}

/// Acquisition progress reported by the worker while loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProgress {
    #[serde(rename = "text")]
    pub status_text: String,
    /// In `[0, 1]`.
    #[serde(rename = "progress")]
    pub fraction: f64,
}

impl LoadProgress {
    pub fn new(status_text: impl Into<String>, fraction: f64) -> Self {
        Self {
            status_text: status_text.into(),
            fraction: fraction.clamp(0.0, 1.0),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percent(&self) -> u8 {
        (self.fraction.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

/// Worker lifecycle as observed by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    Uninitialized,
    Loading(LoadProgress),
    Ready,
    Generating,
    Error(String),
}

impl EngineState {
    /// Edges the controller may take in response to worker events, plus the
    /// `initialize()` recovery edge into `Loading` from any state.
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Loading(_))
                | (Self::Loading(_), Self::Ready | Self::Error(_))
                | (Self::Ready, Self::Generating)
                | (Self::Generating, Self::Ready)
        )
    }

    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub const fn progress(&self) -> Option<&LoadProgress> {
        match self {
            Self::Loading(progress) => Some(progress),
            _ => None,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Loading(progress) => {
                write!(f, "loading ({}%: {})", progress.percent(), progress.status_text)
            }
            Self::Ready => f.write_str("ready"),
            Self::Generating => f.write_str("generating"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}
