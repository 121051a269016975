// Conversation history owned by the host controller

use std::collections::HashSet;

use crate::error::ConversationError;
use crate::models::{Role, Turn, TurnId, TurnStatus};
use crate::protocol::HistoryEntry;

/// Turns created by one `begin_exchange` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: TurnId,
    pub assistant: TurnId,
    /// Context for the `chat` command: every non-sentinel turn up to and
    /// including the new user turn.
    pub history: Vec<HistoryEntry>,
}

/// Insertion-ordered turns plus the set of sentinel (locally injected) turn ids.
///
/// At most one turn is streaming at a time; only that turn's content can grow,
/// and only by appending.
#[derive(Debug, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
    sentinels: HashSet<TurnId>,
    /// Index of the streaming assistant turn, if any.
    streaming: Option<usize>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    #[cfg(test)]
    pub fn get(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.id == id)
    }

    pub fn is_sentinel(&self, id: TurnId) -> bool {
        self.sentinels.contains(&id)
    }

    pub fn in_progress(&self) -> Option<&Turn> {
        self.streaming.and_then(|index| self.turns.get(index))
    }

    /// Appends a UI-originated assistant greeting that never reaches the worker.
    pub fn push_greeting(&mut self, text: &str) -> TurnId {
        let turn = Turn::new(Role::Assistant, text.to_string());
        let id = turn.id;
        self.sentinels.insert(id);
        self.turns.push(turn);
        id
    }

    /// Drops every turn and seeds a single fresh greeting.
    pub fn reset_with_greeting(&mut self, text: &str) -> TurnId {
        self.turns.clear();
        self.sentinels.clear();
        self.streaming = None;
        self.push_greeting(text)
    }

    /// Appends the user's turn and an empty streaming assistant turn.
    pub fn begin_exchange(&mut self, text: &str) -> Result<Exchange, ConversationError> {
        if let Some(turn) = self.in_progress() {
            return Err(ConversationError::AlreadyStreaming(turn.id));
        }

        let user = Turn::new(Role::User, text.to_string());
        let user_id = user.id;
        self.turns.push(user);
        let history = self.context();

        let assistant = Turn::placeholder();
        let assistant_id = assistant.id;
        self.streaming = Some(self.turns.len());
        self.turns.push(assistant);

        Ok(Exchange {
            user: user_id,
            assistant: assistant_id,
            history,
        })
    }

    /// Context array for a `chat` command, in insertion order, sentinels excluded.
    pub fn context(&self) -> Vec<HistoryEntry> {
        self.turns
            .iter()
            .filter(|turn| !self.sentinels.contains(&turn.id))
            .map(|turn| HistoryEntry {
                role: turn.role,
                content: turn.content.clone(),
            })
            .collect()
    }

    /// Appends `chunk` to `id` if it is a streaming assistant turn.
    pub fn append_chunk(&mut self, id: TurnId, chunk: &str) -> bool {
        match self.streaming_mut(id) {
            Some(turn) => {
                turn.push_chunk(chunk);
                true
            }
            None => false,
        }
    }

    pub fn complete(&mut self, id: TurnId) -> bool {
        self.settle(id, TurnStatus::Complete)
    }

    pub fn fail(&mut self, id: TurnId, message: &str) -> bool {
        self.settle(id, TurnStatus::Failed(message.to_string()))
    }

    pub fn total_tokens(&self) -> usize {
        self.turns.iter().map(|turn| turn.tokens).sum()
    }

    fn settle(&mut self, id: TurnId, status: TurnStatus) -> bool {
        match self.streaming_mut(id) {
            Some(turn) => {
                turn.status = status;
                self.streaming = None;
                true
            }
            None => false,
        }
    }

    fn streaming_mut(&mut self, id: TurnId) -> Option<&mut Turn> {
        let index = self.streaming?;
        self.turns.get_mut(index).filter(|turn| turn.id == id)
    }
}
