//! Local-runtime provider speaking the Ollama chat API.
//!
//! Non-streaming calls hit `POST /api/chat` with `stream: false`;
//! streaming responses arrive as newline-delimited JSON objects, one
//! `message.content` fragment per line, with `"done": true` on the
//! final object.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{LlmClient, SamplingConfig};
use crate::prompt::Prompt;

const PROVIDER: &str = "ollama";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    base_url: String,
    model: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
            client,
        }
    }

    fn request_body(&self, prompt: &Prompt, sampling: &SamplingConfig, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "options": {
                "temperature": sampling.temperature,
                "num_predict": sampling.max_tokens,
            },
            "stream": stream,
        })
    }

    async fn send(
        &self,
        prompt: &Prompt,
        sampling: &SamplingConfig,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(prompt, sampling, stream))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: PROVIDER,
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    LlmError::Connection {
                        provider: PROVIDER,
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Request {
                provider: PROVIDER,
                message: format!("HTTP {status}: {body}"),
            });
        }
        Ok(response)
    }
}

fn message_content(value: &Value) -> Option<&str> {
    value
        .get("message")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(
        &self,
        prompt: &Prompt,
        sampling: &SamplingConfig,
    ) -> Result<String, LlmError> {
        let response = self.send(prompt, sampling, false).await?;
        let json: Value = response.json().await.map_err(|e| LlmError::Parse {
            provider: PROVIDER,
            message: e.to_string(),
        })?;
        message_content(&json)
            .map(str::to_string)
            .ok_or_else(|| LlmError::Parse {
                provider: PROVIDER,
                message: "response missing message.content".to_string(),
            })
    }

    async fn stream(
        &self,
        prompt: &Prompt,
        sampling: &SamplingConfig,
        tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError> {
        let response = self.send(prompt, sampling, true).await?;
        let mut body = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(piece) = body.next().await {
            let bytes = piece.map_err(|e| LlmError::Streaming {
                provider: PROVIDER,
                message: e.to_string(),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(data) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                if let Some(fragment) = message_content(&data) {
                    if tx.send(fragment.to_string()).await.is_err() {
                        tracing::debug!(provider = PROVIDER, "stream consumer gone, stopping");
                        return Ok(());
                    }
                }
                if data.get("done").and_then(Value::as_bool) == Some(true) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
