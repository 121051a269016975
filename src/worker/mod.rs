// Inference worker: an isolated tokio task serving commands one at a time

pub mod ollama;
pub mod scripted;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{ControllerError, WorkerError};
use crate::models::LoadProgress;
use crate::protocol::{Command, CommandEnvelope, CommandKind, Event, EventEnvelope, HistoryEntry, RequestId};

use ollama::OllamaModel;
use scripted::ScriptedModel;

/// What the worker needs to build its model on the first `load`.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub backend: BackendConfig,
    pub request_timeout: u64,
}

/// Emits events tagged with the id of the command being served.
#[derive(Debug, Clone)]
pub struct Reporter {
    id: RequestId,
    events: mpsc::UnboundedSender<EventEnvelope>,
}

impl Reporter {
    pub const fn new(id: RequestId, events: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        Self { id, events }
    }

    pub fn emit(&self, event: Event) {
        if self.events.send(EventEnvelope::new(self.id, event)).is_err() {
            debug!(id = %self.id, "controller gone, dropping event");
        }
    }

    pub fn progress(&self, text: impl Into<String>, fraction: f64) {
        self.emit(Event::LoadProgress(LoadProgress::new(text, fraction)));
    }

    pub fn chunk(&self, text: impl Into<String>) {
        self.emit(Event::ChatChunk(text.into()));
    }
}

/// A constructed model, dispatched by backend.
#[derive(Debug)]
pub enum LoadedModel {
    Ollama(OllamaModel),
    Scripted(ScriptedModel),
}

impl LoadedModel {
    pub async fn load(spec: &ModelSpec, reporter: &Reporter) -> Result<Self, WorkerError> {
        match &spec.backend {
            BackendConfig::Ollama(config) => {
                OllamaModel::load(config, spec.request_timeout, reporter)
                    .await
                    .map(Self::Ollama)
            }
            BackendConfig::Scripted(config) => {
                ScriptedModel::load(config, reporter).await.map(Self::Scripted)
            }
        }
    }

    pub async fn generate(
        &mut self,
        history: &[HistoryEntry],
        reporter: &Reporter,
    ) -> Result<(), WorkerError> {
        match self {
            Self::Ollama(model) => model.generate(history, reporter).await,
            Self::Scripted(model) => model.generate(history, reporter).await,
        }
    }

    /// Forgets conversational state; the weights stay loaded.
    pub fn reset(&mut self) {
        match self {
            Self::Ollama(model) => model.reset(),
            Self::Scripted(model) => model.reset(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Ollama(model) => model.describe(),
            Self::Scripted(_) => "scripted".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Unloaded,
    Loading,
    Ready,
    Generating,
    /// The last load attempt failed; the next `load` starts over.
    Failed,
}

struct Worker {
    spec: ModelSpec,
    phase: Phase,
    model: Option<LoadedModel>,
    events: mpsc::UnboundedSender<EventEnvelope>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CommandEnvelope>) {
        info!("worker started");
        while let Some(CommandEnvelope { id, command }) = commands.recv().await {
            debug!(%id, command = %command.kind(), phase = ?self.phase, "command received");
            let reporter = Reporter::new(id, self.events.clone());
            match command {
                Command::Load => self.load(&reporter).await,
                Command::Chat { history } => self.chat(&history, &reporter).await,
                Command::Reset => self.reset(&reporter),
            }
        }
        info!("command channel closed, worker stopping");
    }

    async fn load(&mut self, reporter: &Reporter) {
        if self.phase == Phase::Ready && self.model.is_some() {
            debug!("model already loaded");
            reporter.emit(Event::LoadComplete);
            return;
        }

        self.phase = Phase::Loading;
        self.model = None;
        match LoadedModel::load(&self.spec, reporter).await {
            Ok(model) => {
                info!(model = %model.describe(), "model ready");
                self.model = Some(model);
                self.phase = Phase::Ready;
                reporter.emit(Event::LoadComplete);
            }
            Err(e) => {
                let message = e.into_message();
                warn!(error = %message, "model load failed");
                self.phase = Phase::Failed;
                reporter.emit(Event::LoadError(message));
            }
        }
    }

    async fn chat(&mut self, history: &[HistoryEntry], reporter: &Reporter) {
        let model = match (&self.phase, self.model.as_mut()) {
            (Phase::Ready, Some(model)) => model,
            _ => {
                warn!(phase = ?self.phase, "rejecting chat, model not loaded");
                reporter.emit(Event::Rejected {
                    command: CommandKind::Chat,
                    reason: WorkerError::NotLoaded.to_string(),
                });
                return;
            }
        };

        self.phase = Phase::Generating;
        debug!(turns = history.len(), "generation started");
        match model.generate(history, reporter).await {
            Ok(()) => {
                debug!("generation finished");
                reporter.emit(Event::ChatComplete);
            }
            Err(e) => {
                let message = e.into_message();
                warn!(error = %message, "generation failed");
                reporter.emit(Event::ChatError(message));
            }
        }
        self.phase = Phase::Ready;
    }

    fn reset(&mut self, reporter: &Reporter) {
        if let Some(model) = self.model.as_mut() {
            model.reset();
        }
        debug!(phase = ?self.phase, "conversation cache cleared");
        reporter.emit(Event::ResetComplete);
    }
}

/// Owning handle to a running worker. Dropping it terminates the task.
#[derive(Debug)]
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<CommandEnvelope>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    #[cfg(test)]
    pub(crate) const fn from_parts(
        commands: mpsc::UnboundedSender<CommandEnvelope>,
        task: JoinHandle<()>,
    ) -> Self {
        Self { commands, task }
    }

    pub fn send(&self, envelope: CommandEnvelope) -> Result<(), ControllerError> {
        self.commands
            .send(envelope)
            .map_err(|_| ControllerError::WorkerUnavailable)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns a worker in the `Unloaded` phase; nothing is constructed until `load`.
pub fn spawn_worker(spec: ModelSpec, events: mpsc::UnboundedSender<EventEnvelope>) -> WorkerHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let worker = Worker {
        spec,
        phase: Phase::Unloaded,
        model: None,
        events,
    };
    let task = tokio::spawn(worker.run(command_rx));
    WorkerHandle { commands, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptedConfig;
    use crate::models::Role;
    use std::time::Duration;

    struct Harness {
        handle: WorkerHandle,
        events: mpsc::UnboundedReceiver<EventEnvelope>,
        next_id: u64,
    }

    impl Harness {
        fn new(config: ScriptedConfig) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let spec = ModelSpec {
                backend: BackendConfig::Scripted(config),
                request_timeout: 5,
            };
            Self {
                handle: spawn_worker(spec, tx),
                events,
                next_id: 0,
            }
        }

        fn send(&mut self, command: Command) -> RequestId {
            self.next_id += 1;
            let id = RequestId(self.next_id);
            self.handle.send(CommandEnvelope { id, command }).unwrap();
            id
        }

        async fn next(&mut self) -> EventEnvelope {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for worker event")
                .expect("worker event channel closed")
        }

        /// Events for one command, up to and including its terminal event.
        async fn until_terminal(&mut self, id: RequestId) -> Vec<Event> {
            let mut events = Vec::new();
            loop {
                let envelope = self.next().await;
                assert_eq!(envelope.id, id);
                let terminal = envelope.event.is_terminal();
                events.push(envelope.event);
                if terminal {
                    return events;
                }
            }
        }
    }

    fn chat(text: &str) -> Command {
        Command::Chat {
            history: vec![HistoryEntry {
                role: Role::User,
                content: text.to_string(),
            }],
        }
    }

    fn replying(reply: &str) -> ScriptedConfig {
        ScriptedConfig {
            reply: Some(reply.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_load_reports_progress_then_complete() {
        let mut harness = Harness::new(ScriptedConfig::default());
        let id = harness.send(Command::Load);
        let events = harness.until_terminal(id).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], Event::LoadProgress(_)));
        assert_eq!(events.last(), Some(&Event::LoadComplete));
    }

    #[tokio::test]
    async fn test_load_when_ready_completes_immediately() {
        let mut harness = Harness::new(ScriptedConfig::default());
        let first = harness.send(Command::Load);
        harness.until_terminal(first).await;

        let second = harness.send(Command::Load);
        assert_eq!(harness.until_terminal(second).await, vec![Event::LoadComplete]);
    }

    #[tokio::test]
    async fn test_chat_streams_chunks_then_complete() {
        let mut harness = Harness::new(replying("Hi there"));
        let load = harness.send(Command::Load);
        harness.until_terminal(load).await;

        let id = harness.send(chat("Hello"));
        assert_eq!(
            harness.until_terminal(id).await,
            vec![
                Event::ChatChunk("Hi".to_string()),
                Event::ChatChunk(" there".to_string()),
                Event::ChatComplete,
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_before_load_is_rejected() {
        let mut harness = Harness::new(ScriptedConfig::default());
        let id = harness.send(chat("Hello"));
        assert_eq!(
            harness.until_terminal(id).await,
            vec![Event::Rejected {
                command: CommandKind::Chat,
                reason: "model is not loaded".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_load_then_chat_is_rejected_and_reload_retries() {
        let mut harness = Harness::new(ScriptedConfig {
            fail_load: Some("network timeout".to_string()),
            ..Default::default()
        });
        let load = harness.send(Command::Load);
        assert_eq!(
            harness.until_terminal(load).await.last(),
            Some(&Event::LoadError("network timeout".to_string()))
        );

        let id = harness.send(chat("Hello"));
        assert!(matches!(
            harness.until_terminal(id).await.as_slice(),
            [Event::Rejected { command: CommandKind::Chat, .. }]
        ));

        // A fresh attempt runs the stages again instead of replaying the error
        let retry = harness.send(Command::Load);
        let events = harness.until_terminal(retry).await;
        assert!(matches!(events[0], Event::LoadProgress(_)));
        assert_eq!(
            events.last(),
            Some(&Event::LoadError("network timeout".to_string()))
        );
    }

    #[tokio::test]
    async fn test_reset_keeps_model_loaded() {
        let mut harness = Harness::new(replying("ok"));
        let load = harness.send(Command::Load);
        harness.until_terminal(load).await;

        let reset = harness.send(Command::Reset);
        assert_eq!(harness.until_terminal(reset).await, vec![Event::ResetComplete]);

        let id = harness.send(chat("still there?"));
        assert_eq!(
            harness.until_terminal(id).await,
            vec![Event::ChatChunk("ok".to_string()), Event::ChatComplete]
        );
    }

    #[tokio::test]
    async fn test_reset_during_generation_is_served_after_it() {
        let mut harness = Harness::new(ScriptedConfig {
            reply: Some("one two three".to_string()),
            chunk_delay_ms: 10,
            ..Default::default()
        });
        let load = harness.send(Command::Load);
        harness.until_terminal(load).await;

        let chat_id = harness.send(chat("count"));
        let reset_id = harness.send(Command::Reset);

        let events = harness.until_terminal(chat_id).await;
        assert_eq!(events.last(), Some(&Event::ChatComplete));
        assert_eq!(events.len(), 4);
        assert_eq!(harness.until_terminal(reset_id).await, vec![Event::ResetComplete]);
    }

    #[tokio::test]
    async fn test_reset_before_load_completes() {
        let mut harness = Harness::new(ScriptedConfig::default());
        let id = harness.send(Command::Reset);
        assert_eq!(harness.until_terminal(id).await, vec![Event::ResetComplete]);
    }

    #[tokio::test]
    async fn test_generation_error_returns_worker_to_ready() {
        let mut harness = Harness::new(ScriptedConfig {
            reply: Some("Hi there".to_string()),
            fail_chat: Some("out of memory".to_string()),
            ..Default::default()
        });
        let load = harness.send(Command::Load);
        harness.until_terminal(load).await;

        let first = harness.send(chat("Hello"));
        assert_eq!(
            harness.until_terminal(first).await,
            vec![
                Event::ChatChunk("Hi".to_string()),
                Event::ChatError("out of memory".to_string()),
            ]
        );

        // Still ready: the next chat is served, not rejected
        let second = harness.send(chat("again"));
        let events = harness.until_terminal(second).await;
        assert_eq!(events.last(), Some(&Event::ChatError("out of memory".to_string())));
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_worker() {
        let harness = Harness::new(ScriptedConfig::default());
        let Harness { handle, mut events, .. } = harness;
        assert!(handle.is_running());
        drop(handle);

        let closed = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }
}
