// Host controller: single writer of the conversation and engine state

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AssistantConfig;
use crate::conversation::Conversation;
use crate::error::ControllerError;
use crate::models::{EngineState, LoadProgress, Turn, TurnId};
use crate::protocol::{Command, CommandEnvelope, Event, EventEnvelope, RequestId};
use crate::worker::{spawn_worker, ModelSpec, WorkerHandle};

/// What changed after folding one event, for the front end to re-render.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    Progress(LoadProgress),
    Ready,
    LoadFailed(String),
    Chunk { turn: TurnId, text: String },
    TurnFinished(TurnId),
    TurnFailed { turn: TurnId, message: String },
    ConversationReset,
}

/// A command that has been issued and whose terminal event has not arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Load,
    Chat { turn: TurnId },
    Reset,
}

#[derive(Debug)]
pub struct AssistantController {
    spec: ModelSpec,
    greeting: String,
    conversation: Conversation,
    state: EngineState,
    worker: Option<WorkerHandle>,
    events: Option<mpsc::UnboundedReceiver<EventEnvelope>>,
    pending: HashMap<RequestId, Pending>,
    next_id: u64,
}

impl AssistantController {
    pub fn new(spec: ModelSpec, greeting: impl Into<String>) -> Self {
        Self {
            spec,
            greeting: greeting.into(),
            conversation: Conversation::new(),
            state: EngineState::Uninitialized,
            worker: None,
            events: None,
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn from_config(config: &AssistantConfig) -> Self {
        let spec = ModelSpec {
            backend: config.backend.clone(),
            request_timeout: config.request_timeout,
        };
        Self::new(spec, config.greeting.clone())
    }

    pub const fn state(&self) -> &EngineState {
        &self.state
    }

    pub const fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub const fn load_progress(&self) -> Option<&LoadProgress> {
        self.state.progress()
    }

    /// Input is accepted only while ready and not waiting on a reset.
    pub fn can_send(&self) -> bool {
        self.state.is_ready() && !self.has_pending_reset()
    }

    pub const fn can_retry(&self) -> bool {
        matches!(self.state, EngineState::Error(_))
    }

    /// The greeting just seeded by load or reset, if it is the newest turn.
    pub fn fresh_greeting(&self) -> Option<&Turn> {
        self.conversation
            .last()
            .filter(|turn| self.conversation.is_sentinel(turn.id))
    }

    pub fn total_tokens(&self) -> usize {
        self.conversation.total_tokens()
    }

    pub fn context_usage_percentage(&self, context_window_size: usize) -> f64 {
        crate::tokens::context_usage_percentage(self.total_tokens(), context_window_size)
    }

    /// Discards any existing worker, spawns a fresh one and asks it to load.
    ///
    /// Accepted in every state: this is the first-mount action, the retry
    /// action after a load error, and the only way out of a stalled phase.
    pub fn initialize(&mut self) -> Result<RequestId, ControllerError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = spawn_worker(self.spec.clone(), events_tx);
        self.attach(worker, events_rx)
    }

    fn attach(
        &mut self,
        worker: WorkerHandle,
        events: mpsc::UnboundedReceiver<EventEnvelope>,
    ) -> Result<RequestId, ControllerError> {
        if self.worker.take().is_some() {
            info!(state = %self.state, "replacing worker");
        }
        self.pending.clear();
        if let Some(turn) = self.conversation.in_progress().map(|turn| turn.id) {
            self.conversation.fail(turn, "assistant restarted");
        }

        self.worker = Some(worker);
        self.events = Some(events);
        self.transition(EngineState::Loading(LoadProgress::new("Starting", 0.0)));
        self.issue(Command::Load, Pending::Load)
    }

    /// Appends the user turn plus an empty assistant turn and starts generation.
    /// Returns the id of the assistant turn that will receive the chunks.
    pub fn send_message(&mut self, text: &str) -> Result<TurnId, ControllerError> {
        if !self.state.is_ready() {
            return Err(ControllerError::NotReady(self.state.clone()));
        }
        if self.has_pending_reset() {
            return Err(ControllerError::ResetPending);
        }
        if self.worker.is_none() {
            return Err(ControllerError::WorkerUnavailable);
        }

        let exchange = self.conversation.begin_exchange(text)?;
        debug!(
            user_turn = %exchange.user,
            turns = exchange.history.len(),
            tokens = crate::tokens::count_context_tokens(&exchange.history),
            "sending chat context"
        );
        let command = Command::Chat {
            history: exchange.history,
        };
        if let Err(e) = self.issue(command, Pending::Chat { turn: exchange.assistant }) {
            self.conversation.fail(exchange.assistant, &e.to_string());
            return Err(e);
        }

        self.transition(EngineState::Generating);
        Ok(exchange.assistant)
    }

    /// Asks the worker to drop its conversational cache. The conversation is
    /// replaced once `reset-complete` arrives; the engine state is untouched.
    pub fn reset(&mut self) -> Result<RequestId, ControllerError> {
        if matches!(self.state, EngineState::Generating) {
            return Err(ControllerError::NotReady(self.state.clone()));
        }
        if self.has_pending_reset() {
            return Err(ControllerError::ResetPending);
        }
        self.issue(Command::Reset, Pending::Reset)
    }

    /// Waits for the next worker event. Never resolves while no worker exists.
    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        let Some(events) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        let envelope = events.recv().await;
        if envelope.is_none() {
            self.worker_lost();
        }
        envelope
    }

    /// Folds every event already queued, without waiting.
    #[cfg(test)]
    pub fn pump(&mut self) -> Vec<ViewUpdate> {
        let mut updates = Vec::new();
        while let Some(envelope) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) {
            updates.extend(self.handle_event(envelope));
        }
        updates
    }

    pub fn handle_event(&mut self, envelope: EventEnvelope) -> Option<ViewUpdate> {
        let EventEnvelope { id, event } = envelope;
        let Some(&pending) = self.pending.get(&id) else {
            debug!(%id, ?event, "dropping event for unknown request");
            return None;
        };
        if event.is_terminal() {
            self.pending.remove(&id);
        }

        match (pending, event) {
            (Pending::Load, Event::LoadProgress(progress)) => {
                self.transition(EngineState::Loading(progress.clone()));
                Some(ViewUpdate::Progress(progress))
            }
            (Pending::Load, Event::LoadComplete) => {
                self.transition(EngineState::Ready);
                if self.conversation.is_empty() {
                    self.conversation.push_greeting(&self.greeting);
                }
                info!("assistant ready");
                Some(ViewUpdate::Ready)
            }
            (Pending::Load, Event::LoadError(message) | Event::Rejected { reason: message, .. }) => {
                warn!(%id, error = %message, "assistant failed to load");
                self.transition(EngineState::Error(message.clone()));
                Some(ViewUpdate::LoadFailed(message))
            }
            (Pending::Chat { turn }, Event::ChatChunk(text)) => {
                if self.conversation.append_chunk(turn, &text) {
                    Some(ViewUpdate::Chunk { turn, text })
                } else {
                    debug!(%id, %turn, "dropping chunk for settled turn");
                    None
                }
            }
            (Pending::Chat { turn }, Event::ChatComplete) => {
                self.conversation.complete(turn);
                self.transition(EngineState::Ready);
                Some(ViewUpdate::TurnFinished(turn))
            }
            (Pending::Chat { turn }, Event::ChatError(message) | Event::Rejected { reason: message, .. }) => {
                warn!(%id, %turn, error = %message, "generation failed");
                self.conversation.fail(turn, &message);
                self.transition(EngineState::Ready);
                Some(ViewUpdate::TurnFailed { turn, message })
            }
            (Pending::Reset, Event::ResetComplete) => {
                self.conversation.reset_with_greeting(&self.greeting);
                info!("conversation reset");
                Some(ViewUpdate::ConversationReset)
            }
            (pending, event) => {
                warn!(%id, ?pending, ?event, "event does not belong to pending command");
                None
            }
        }
    }

    /// Terminates the worker. Conversation and state are left as they are.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            info!(running = worker.is_running(), "terminating worker");
        }
        self.events = None;
        self.pending.clear();
    }

    fn issue(&mut self, command: Command, pending: Pending) -> Result<RequestId, ControllerError> {
        let worker = self.worker.as_ref().ok_or(ControllerError::WorkerUnavailable)?;
        self.next_id += 1;
        let id = RequestId(self.next_id);
        debug!(%id, command = %command.kind(), "issuing command");
        worker.send(CommandEnvelope { id, command })?;
        self.pending.insert(id, pending);
        Ok(id)
    }

    fn has_pending_reset(&self) -> bool {
        self.pending.values().any(|pending| *pending == Pending::Reset)
    }

    fn transition(&mut self, next: EngineState) {
        if !self.state.can_transition_to(&next) {
            warn!(from = %self.state, to = %next, "ignoring illegal engine state transition");
            return;
        }
        if std::mem::discriminant(&self.state) != std::mem::discriminant(&next) {
            debug!(from = %self.state, to = %next, "engine state changed");
        }
        self.state = next;
    }

    /// The worker task ended without being asked to; only `initialize()` recovers.
    fn worker_lost(&mut self) {
        error!(state = %self.state, "worker stopped unexpectedly");
        self.worker = None;
        self.events = None;
        self.pending.clear();
        if let Some(turn) = self.conversation.in_progress().map(|turn| turn.id) {
            self.conversation.fail(turn, "worker stopped");
        }
        self.state = EngineState::Error("worker stopped".to_string());
    }
}
