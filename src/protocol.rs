// Message protocol between the host controller and the inference worker

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{LoadProgress, Role};

/// Correlation id assigned by the controller to every command it issues.
/// The worker echoes it on every event produced while serving that command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One entry of the read-only context sent with a `chat` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Controller -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Command {
    Load,
    Chat { history: Vec<HistoryEntry> },
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Load,
    Chat,
    Reset,
}

impl Command {
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Load => CommandKind::Load,
            Self::Chat { .. } => CommandKind::Chat,
            Self::Reset => CommandKind::Reset,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Chat => "chat",
            Self::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Worker -> controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    LoadProgress(LoadProgress),
    LoadComplete,
    LoadError(String),
    ChatChunk(String),
    ChatComplete,
    ChatError(String),
    ResetComplete,
    /// The worker refused a command it cannot serve in its current state.
    Rejected { command: CommandKind, reason: String },
}

impl Event {
    /// Whether this event ends the command it belongs to.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::LoadProgress(_) | Self::ChatChunk(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: RequestId,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: RequestId,
    pub event: Event,
}

impl EventEnvelope {
    pub const fn new(id: RequestId, event: Event) -> Self {
        Self { id, event }
    }
}
