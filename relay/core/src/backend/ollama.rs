//! Ollama Producer
//!
//! Streams completions from a local Ollama server into a [`TokenSource`].
//!
//! # Ollama API
//!
//! - `/api/generate` - Generate completions (newline-delimited JSON when streaming)
//! - `/api/tags` - List available models

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{source_from_channel, LlmBackend, LlmRequest, ModelInfo, TokenSource};
use crate::error::RelayError;
use crate::transport::frame::NdjsonDecoder;

/// Channel capacity between the HTTP reader task and the session writer
const TOKEN_CHANNEL_CAPACITY: usize = 256;

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    host: String,
    port: u16,
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            host: host.into(),
            port,
            http_client,
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    fn build_prompt(request: &LlmRequest) -> String {
        match request.system {
            Some(ref system) => format!("{system}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        }
    }

    fn build_body(request: &LlmRequest) -> serde_json::Value {
        let mut options = serde_json::Map::new();
        options.insert("temperature".into(), serde_json::json!(request.temperature));
        if request.max_tokens > 0 {
            options.insert("num_predict".into(), serde_json::json!(request.max_tokens));
        }
        serde_json::json!({
            "model": request.model,
            "prompt": Self::build_prompt(request),
            "stream": true,
            "options": options,
        })
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new("localhost", 11434)
    }
}

/// Outcome of one decoded Ollama line
#[derive(Debug, PartialEq)]
enum GenerateLine {
    Token(String),
    Done,
    Failed(String),
    Skip,
}

fn parse_generate_line(data: &serde_json::Value) -> GenerateLine {
    if let Some(error) = data.get("error").and_then(serde_json::Value::as_str) {
        return GenerateLine::Failed(error.to_string());
    }
    if data
        .get("done")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return GenerateLine::Done;
    }
    match data.get("response").and_then(serde_json::Value::as_str) {
        Some(token) if !token.is_empty() => GenerateLine::Token(token.to_string()),
        _ => GenerateLine::Skip,
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }

    async fn stream_tokens(&self, request: &LlmRequest) -> anyhow::Result<TokenSource<String>> {
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&Self::build_body(request))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let mut bytes = response.bytes_stream();
        let model = request.model.clone();

        tokio::spawn(async move {
            let mut decoder = NdjsonDecoder::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(RelayError::producer(e))).await;
                        return;
                    }
                };
                decoder.push(&chunk);

                loop {
                    let line = match decoder.decode::<serde_json::Value>() {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    let item = match parse_generate_line(&line) {
                        GenerateLine::Token(token) => Ok(token),
                        GenerateLine::Failed(error) => Err(RelayError::Producer(error)),
                        GenerateLine::Done => {
                            tracing::debug!(model = %model, "Ollama generation finished");
                            return;
                        }
                        GenerateLine::Skip => continue,
                    };
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() || failed {
                        // Receiver dropped (writer aborted) or the stream already failed
                        return;
                    }
                }
            }

            // Body ended without a done marker
            let _ = tx
                .send(Err(RelayError::producer("Ollama stream ended unexpectedly")))
                .await;
        });

        Ok(source_from_channel(rx))
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;

        let models = data
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        let name = m.get("name")?.as_str()?.to_string();
                        let size = m.get("size").and_then(serde_json::Value::as_u64);
                        let parameters = m
                            .get("details")
                            .and_then(|d| d.get("parameter_size"))
                            .and_then(|p| p.as_str())
                            .map(String::from);
                        Some(ModelInfo {
                            name,
                            size,
                            parameters,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }
}
