// Ollama-backed model: HTTP client plus the load/generate stages the worker drives

use anyhow::{Context, Result};
use futures::stream::{Stream, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

use super::Reporter;
use crate::config::OllamaConfig;
use crate::error::WorkerError;
use crate::protocol::HistoryEntry;

type NdjsonStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct WarmUpRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub message: Option<ChatResponseMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponseMessage {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ShowResponse {
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelDetails {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

impl OllamaClient {
    pub fn new(base_url: String, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Number of models installed on the server; doubles as a reachability check.
    pub async fn count_models(&self) -> Result<usize> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Failed to list models: {status}");
        }

        let result = response
            .json::<TagsResponse>()
            .await
            .context("Failed to parse tags response")?;

        Ok(result.models.len())
    }

    pub async fn show_model(&self, model_name: &str) -> Result<ShowResponse> {
        let url = format!("{}/api/show", self.base_url);

        let request = serde_json::json!({
            "name": model_name
        });

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send show request")?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Failed to show model {model_name}: {status}");
        }

        response
            .json::<ShowResponse>()
            .await
            .context("Failed to parse show response")
    }

    /// An empty prompt makes the server load the weights without generating.
    pub async fn warm_up(&self, model_name: &str) -> Result<()> {
        let url = format!("{}/api/generate", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&WarmUpRequest {
                model: model_name,
                prompt: "",
                stream: false,
            })
            .send()
            .await
            .context("Failed to send warm-up request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to load {model_name} with status {status}: {text}");
        }

        Ok(())
    }

    pub async fn chat_stream(&self, request: ChatRequest) -> Result<NdjsonStream<ChatResponse>> {
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send chat request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("API request failed with status {status}: {text}");
        }

        Ok(ndjson_stream(response))
    }
}

/// Splits a streamed body into newline-delimited JSON objects, buffering
/// partial lines across network chunks.
fn ndjson_stream<T>(response: reqwest::Response) -> NdjsonStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    let stream = futures::stream::unfold(
        (response.bytes_stream(), Vec::new()),
        |(mut byte_stream, mut buffer)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let rest = buffer.split_off(pos + 1);
                    let line = std::mem::replace(&mut buffer, rest);

                    let text = String::from_utf8_lossy(&line);
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        let result = serde_json::from_str::<T>(trimmed)
                            .context("Failed to parse streaming response");
                        return Some((result, (byte_stream, buffer)));
                    }
                    continue;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("Stream error: {e}")),
                            (byte_stream, buffer),
                        ));
                    }
                    None => {
                        // Last object may arrive without a trailing newline
                        let text = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if text.is_empty() {
                            return None;
                        }
                        let result = serde_json::from_str::<T>(&text)
                            .context("Failed to parse final streaming response");
                        return Some((result, (byte_stream, buffer)));
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

/// A model resident on an Ollama server.
#[derive(Debug)]
pub struct OllamaModel {
    client: OllamaClient,
    config: OllamaConfig,
    details: ModelDetails,
    /// Prompt size the server reported for the last exchange.
    last_prompt_tokens: Option<u64>,
}

impl OllamaModel {
    pub async fn load(
        config: &OllamaConfig,
        request_timeout: u64,
        reporter: &Reporter,
    ) -> Result<Self, WorkerError> {
        let client = OllamaClient::new(config.url.clone(), request_timeout).map_err(load_error)?;

        reporter.progress(format!("Connecting to {}", config.url), 0.1);
        let installed = client.count_models().await.map_err(load_error)?;
        debug!(installed, url = %config.url, "ollama reachable");

        reporter.progress("Fetching model info", 0.4);
        let info = client.show_model(&config.model).await.map_err(load_error)?;

        reporter.progress(format!("Loading {} into memory", config.model), 0.7);
        client.warm_up(&config.model).await.map_err(load_error)?;

        reporter.progress("Ready", 1.0);
        let details = info.details.unwrap_or_default();
        info!(
            model = %config.model,
            family = %details.family,
            parameters = %details.parameter_size,
            quantization = %details.quantization_level,
            "ollama model loaded"
        );

        Ok(Self {
            client,
            config: config.clone(),
            details,
            last_prompt_tokens: None,
        })
    }

    pub async fn generate(
        &mut self,
        history: &[HistoryEntry],
        reporter: &Reporter,
    ) -> Result<(), WorkerError> {
        let request = self.chat_request(history);
        let mut stream = self
            .client
            .chat_stream(request)
            .await
            .map_err(generation_error)?;

        while let Some(result) = stream.next().await {
            let response = result.map_err(generation_error)?;
            if let Some(error) = response.error {
                return Err(WorkerError::Generation(error));
            }
            if let Some(message) = response.message {
                if !message.content.is_empty() {
                    reporter.chunk(message.content);
                }
            }
            if response.done {
                self.last_prompt_tokens = response.prompt_eval_count;
                debug!(prompt_tokens = ?self.last_prompt_tokens, "ollama generation finished");
                break;
            }
        }

        Ok(())
    }

    pub fn reset(&mut self) {
        self.last_prompt_tokens = None;
    }

    #[cfg(test)]
    pub const fn last_prompt_tokens(&self) -> Option<u64> {
        self.last_prompt_tokens
    }

    pub fn describe(&self) -> String {
        if self.details.parameter_size.is_empty() {
            self.config.model.clone()
        } else {
            format!("{} ({})", self.config.model, self.details.parameter_size)
        }
    }

    fn chat_request(&self, history: &[HistoryEntry]) -> ChatRequest {
        let system = self.config.system_prompt.iter().map(|prompt| ChatMessage {
            role: "system".to_string(),
            content: prompt.clone(),
        });
        let turns = history.iter().map(|entry| ChatMessage {
            role: entry.role.as_str().to_string(),
            content: entry.content.clone(),
        });

        ChatRequest {
            model: self.config.model.clone(),
            messages: system.chain(turns).collect(),
            stream: true,
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn load_error(e: anyhow::Error) -> WorkerError {
    WorkerError::Load(format!("{e:#}"))
}

#[allow(clippy::needless_pass_by_value)]
fn generation_error(e: anyhow::Error) -> WorkerError {
    WorkerError::Generation(format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::protocol::{Event, EventEnvelope, RequestId};
    use serde_json::json;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reporter() -> (Reporter, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Reporter::new(RequestId(1), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EventEnvelope>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    fn config_for(server: &MockServer) -> OllamaConfig {
        OllamaConfig {
            url: server.uri(),
            model: "tiny".to_string(),
            system_prompt: Some("Be brief.".to_string()),
        }
    }

    async fn mount_load_endpoints(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [{ "name": "tiny" }] })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "details": { "family": "llama", "parameter_size": "1B", "quantization_level": "Q4_0" }
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "model": "tiny", "prompt": "" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "", "done": true })))
            .mount(server)
            .await;
    }

    async fn loaded_model(server: &MockServer) -> OllamaModel {
        mount_load_endpoints(server).await;
        let (reporter, _rx) = reporter();
        OllamaModel::load(&config_for(server), 5, &reporter).await.unwrap()
    }

    #[tokio::test]
    async fn test_load_reports_stages_in_order() {
        let server = MockServer::start().await;
        mount_load_endpoints(&server).await;
        let (reporter, mut rx) = reporter();

        let model = OllamaModel::load(&config_for(&server), 5, &reporter).await.unwrap();
        assert_eq!(model.describe(), "tiny (1B)");

        let fractions: Vec<f64> = drain(&mut rx)
            .into_iter()
            .map(|event| match event {
                Event::LoadProgress(progress) => progress.fraction,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(fractions, vec![0.1, 0.4, 0.7, 1.0]);
    }

    #[tokio::test]
    async fn test_load_fails_for_unknown_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (reporter, _rx) = reporter();

        let err = OllamaModel::load(&config_for(&server), 5, &reporter)
            .await
            .unwrap_err();
        match err {
            WorkerError::Load(message) => assert!(message.contains("404"), "{message}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_fails_when_server_unreachable() {
        let config = OllamaConfig {
            url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let (reporter, _rx) = reporter();

        let result = OllamaModel::load(&config, 2, &reporter).await;
        assert!(matches!(result, Err(WorkerError::Load(_))));
    }

    #[tokio::test]
    async fn test_generate_streams_message_content() {
        let server = MockServer::start().await;
        let mut model = loaded_model(&server).await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":12}"
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "tiny",
                "stream": true,
                "messages": [
                    { "role": "system", "content": "Be brief." },
                    { "role": "user", "content": "Hello" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (reporter, mut rx) = reporter();
        let history = vec![HistoryEntry {
            role: Role::User,
            content: "Hello".to_string(),
        }];
        model.generate(&history, &reporter).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                Event::ChatChunk("Hi".to_string()),
                Event::ChatChunk(" there".to_string())
            ]
        );
        assert_eq!(model.last_prompt_tokens(), Some(12));

        model.reset();
        assert_eq!(model.last_prompt_tokens(), None);
    }

    #[tokio::test]
    async fn test_generate_surfaces_server_error_line() {
        let server = MockServer::start().await;
        let mut model = loaded_model(&server).await;
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
            "{\"error\":\"model crashed\"}\n"
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (reporter, mut rx) = reporter();
        let err = model.generate(&[], &reporter).await.unwrap_err();
        assert_eq!(err, WorkerError::Generation("model crashed".to_string()));
        assert_eq!(drain(&mut rx), vec![Event::ChatChunk("Hi".to_string())]);
    }

    #[tokio::test]
    async fn test_generate_fails_on_http_error() {
        let server = MockServer::start().await;
        let mut model = loaded_model(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (reporter, _rx) = reporter();
        let result = model.generate(&[], &reporter).await;
        assert!(matches!(result, Err(WorkerError::Generation(message)) if message.contains("500")));
    }
}
