//! Producer Traits
//!
//! A producer is anything that yields tokens over time and then either ends
//! or fails. The registry only sees the [`TokenSource`] stream; LLM clients
//! implement [`LlmBackend`] to hand one out per request.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::RelayError;

/// A producer stream: tokens, then normal end (`None`) or an error
pub type TokenSource<T> = BoxStream<'static, Result<T, RelayError>>;

/// Producer that yields every item of an iterator and then completes
pub fn source_from_iter<T, I>(items: I) -> TokenSource<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
{
    stream::iter(items.into_iter().map(Ok)).boxed()
}

/// Producer that replays a scripted sequence of items and failures
///
/// Stops after the first error, like a real producer would.
pub fn source_from_results<T, I>(items: I) -> TokenSource<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Result<T, RelayError>>,
    I::IntoIter: Send + 'static,
{
    stream::iter(items)
        .scan(false, |failed, item| {
            if *failed {
                return futures::future::ready(None);
            }
            *failed = item.is_err();
            futures::future::ready(Some(item))
        })
        .boxed()
}

/// Producer fed from a channel; completes when every sender is dropped
pub fn source_from_channel<T>(rx: mpsc::Receiver<Result<T, RelayError>>) -> TokenSource<T>
where
    T: Send + 'static,
{
    ReceiverStream::new(rx).boxed()
}

/// Configuration for LLM requests
#[derive(Clone, Debug)]
pub struct LlmRequest {
    /// The prompt/message to send
    pub prompt: String,
    /// Model to use (backend-specific identifier)
    pub model: String,
    /// Maximum tokens in response (0 = default)
    pub max_tokens: u32,
    /// Temperature (0.0-1.0, higher = more creative)
    pub temperature: f32,
    /// System prompt (optional, prepended to the prompt)
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: String::new(),
            max_tokens: 0,
            temperature: 0.7,
            system: None,
        }
    }
}

impl LlmRequest {
    /// Create a new request with prompt and model
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Information about an available model
#[derive(Clone, Debug)]
pub struct ModelInfo {
    /// Model identifier
    pub name: String,
    /// Model size in bytes (if known)
    pub size: Option<u64>,
    /// Parameter count (if known)
    pub parameters: Option<String>,
}

/// LLM backend that can act as a session producer
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Get the backend name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Start a generation and return its token stream
    ///
    /// Failures before the first token are returned here; failures after
    /// that arrive as an `Err` item on the stream.
    async fn stream_tokens(&self, request: &LlmRequest) -> anyhow::Result<TokenSource<String>>;

    /// List available models
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;

    /// Check if a specific model is available
    async fn has_model(&self, model: &str) -> anyhow::Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.name == model))
    }
}
