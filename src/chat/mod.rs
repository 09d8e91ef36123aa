pub mod types;

use std::env;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use types::{ChatMessage, ChatRequest, ChatResponse, StreamChunk};

const DEFAULT_API_BASE: &str = "https://api.together.xyz/v1";
const DEFAULT_MODEL: &str = "meta-llama/Llama-4-Maverick-17B-128E-Instruct-FP8";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("RADIQ_API_KEY not set")]
    ApiKeyNotSet,

    #[error("API rate limit exceeded. Please retry later.")]
    RateLimited,

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("empty completion (no content in response)")]
    EmptyCompletion,

    #[error("stream error: {0}")]
    Stream(String),
}

/// Abstraction over the chat-completion capability.
/// Implemented by `ChatClient` for production; mock implementations used in tests.
pub trait ChatService {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, ChatError>;

    /// Start a streamed completion. Each received item is one content delta;
    /// the channel closing marks the end of the stream. Faults mid-stream are
    /// delivered as an `Err` item and end the stream.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<mpsc::Receiver<Result<String, ChatError>>, ChatError>;
}

#[derive(Clone)]
struct ApiKey(String);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    api_key: ApiKey,
    model: String,
    base_url: String,
}

impl ChatClient {
    pub fn from_env(http: Client) -> Result<Self, ChatError> {
        let api_key = env::var("RADIQ_API_KEY").map_err(|_| ChatError::ApiKeyNotSet)?;
        if api_key.trim().is_empty() {
            return Err(ChatError::ApiKeyNotSet);
        }
        Ok(Self {
            http,
            api_key: ApiKey(api_key.trim().to_string()),
            model: env_or("RADIQ_MODEL", DEFAULT_MODEL),
            base_url: env_or("RADIQ_API_BASE", DEFAULT_API_BASE),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(http: Client, base_url: &str) -> Self {
        Self {
            http,
            api_key: ApiKey("test-key".to_string()),
            model: DEFAULT_MODEL.to_string(),
            base_url: base_url.to_string(),
        }
    }

    async fn request(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        stream: bool,
    ) -> Result<reqwest::Response, ChatError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature,
            stream,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key.0)
            .header("User-Agent", crate::USER_AGENT)
            .json(&request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("chat API rate limited");
            return Err(ChatError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ChatResponse>(&text)
                .ok()
                .and_then(|body| body.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| snippet(&text));
            warn!(status = %status, "chat API error");
            return Err(ChatError::Api {
                code: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn request_with_retry(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        stream: bool,
    ) -> Result<reqwest::Response, ChatError> {
        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            match self.request(messages, temperature, stream).await {
                Ok(response) => return Ok(response),
                Err(e) if is_retriable(&e) => {
                    last_err = Some(e);
                    if attempt + 1 < MAX_RETRIES {
                        let delay_ms = jittered_backoff(attempt);
                        debug!(
                            attempt = attempt + 1,
                            delay_ms, "retrying after transient error"
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ChatError::RateLimited))
    }
}

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;

impl ChatService for ChatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, ChatError> {
        let response = self.request_with_retry(messages, temperature, false).await?;
        let body: ChatResponse = response.json().await?;

        let content = body
            .choices
            .and_then(|choices| choices.into_iter().next())
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .filter(|content| !content.is_empty())
            .ok_or(ChatError::EmptyCompletion)?;

        debug!(model = %self.model, chars = content.len(), "chat completion received");
        Ok(content)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<mpsc::Receiver<Result<String, ChatError>>, ChatError> {
        let response = self.request_with_retry(messages, temperature, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse(response, tx));
        Ok(rx)
    }
}

/// Forward SSE deltas into the channel until `[DONE]`, stream end, or a fault.
/// A dropped receiver (consumer cancelled) stops the pump and the download.
async fn pump_sse(response: reqwest::Response, tx: mpsc::Sender<Result<String, ChatError>>) {
    let mut events = response.bytes_stream().eventsource();

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                let _ = tx.send(Err(ChatError::Stream(e.to_string()))).await;
                return;
            }
        };

        if event.data == "[DONE]" {
            return;
        }

        let chunk: StreamChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx
                    .send(Err(ChatError::Stream(format!(
                        "malformed stream payload: {e}"
                    ))))
                    .await;
                return;
            }
        };

        if let Some(message) = chunk.error.and_then(|e| e.message) {
            let _ = tx.send(Err(ChatError::Stream(message))).await;
            return;
        }

        let delta = chunk
            .choices
            .and_then(|choices| choices.into_iter().next())
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content);

        if let Some(text) = delta
            && !text.is_empty()
        {
            if tx.send(Ok(text)).await.is_err() {
                return;
            }
        }
    }
}

fn is_retriable(e: &ChatError) -> bool {
    matches!(
        e,
        ChatError::RateLimited
            | ChatError::Api {
                code: 500..=599,
                ..
            }
    )
}

/// Equal jitter backoff: base/2 + rand(0, base/2).
fn jittered_backoff(attempt: u32) -> u64 {
    let base = INITIAL_BACKOFF_MS * 2u64.pow(attempt);
    let half = base / 2;
    half + fastrand::u64(..half.max(1))
}

fn snippet(text: &str) -> String {
    text.chars().take(200).collect()
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
