//! Chat-completions client for OpenAI-compatible APIs.
//!
//! OpenAI and Mistral expose the same `POST /chat/completions` surface,
//! so one client serves both; the vendor presets differ only in base
//! URL, credential variable, and the provider name stamped on errors.
//!
//! Streaming consumes the SSE body incrementally via `bytes_stream`:
//! `data:` lines are parsed as they arrive and each content delta is
//! forwarded into the channel. The whole body is never buffered.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::error::{ConfigError, LlmError};
use crate::llm::{LlmClient, SamplingConfig};
use crate::prompt::Prompt;

pub struct OpenAiCompatClient {
    provider: &'static str,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn openai(config: &LlmConfig) -> Result<Self, ConfigError> {
        Self::build(config, "openai", "https://api.openai.com/v1", "OPENAI_API_KEY")
    }

    pub fn mistral(config: &LlmConfig) -> Result<Self, ConfigError> {
        Self::build(config, "mistral", "https://api.mistral.ai/v1", "MISTRAL_API_KEY")
    }

    fn build(
        config: &LlmConfig,
        provider: &'static str,
        default_base: &str,
        key_env: &'static str,
    ) -> Result<Self, ConfigError> {
        let api_key = std::env::var(key_env).map_err(|_| ConfigError::MissingEnv(key_env))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Ok(Self {
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
            client,
        })
    }

    fn request_body(&self, prompt: &Prompt, sampling: &SamplingConfig, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_tokens,
            "stream": stream,
        })
    }

    async fn send(
        &self,
        prompt: &Prompt,
        sampling: &SamplingConfig,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(
            provider = self.provider,
            model = %self.model,
            top_k = sampling.top_k,
            stream,
            "sending completion request"
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(prompt, sampling, stream))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status, &body));
        }
        Ok(response)
    }

    fn map_transport_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                provider: self.provider,
                timeout_secs: self.timeout_secs,
            }
        } else if e.is_connect() {
            LlmError::Connection {
                provider: self.provider,
                message: e.to_string(),
            }
        } else {
            LlmError::Request {
                provider: self.provider,
                message: e.to_string(),
            }
        }
    }

    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::Auth {
                provider: self.provider,
                message: body.to_string(),
            },
            429 => LlmError::RateLimited {
                provider: self.provider,
            },
            s if (500..600).contains(&s) => LlmError::Connection {
                provider: self.provider,
                message: format!("HTTP {status}: {body}"),
            },
            _ => LlmError::Request {
                provider: self.provider,
                message: format!("HTTP {status}: {body}"),
            },
        }
    }
}

/// Extract the content delta from one SSE `data:` payload, if any.
fn content_delta(data: &Value) -> Option<&str> {
    data.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn generate(
        &self,
        prompt: &Prompt,
        sampling: &SamplingConfig,
    ) -> Result<String, LlmError> {
        let response = self.send(prompt, sampling, false).await?;
        let json: Value = response.json().await.map_err(|e| LlmError::Parse {
            provider: self.provider,
            message: e.to_string(),
        })?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::Parse {
                provider: self.provider,
                message: "response missing choices[0].message.content".to_string(),
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
                provider: self.provider,
                message: e.to_string(),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // Process every complete line in the buffer; keep the tail.
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    return Ok(());
                }
                let Ok(data) = serde_json::from_str::<Value>(payload) else {
                    continue;
                };
                if let Some(delta) = content_delta(&data) {
                    if tx.send(delta.to_string()).await.is_err() {
                        // Receiver dropped: the caller abandoned the
                        // stream. Dropping `body` closes the connection.
                        tracing::debug!(provider = self.provider, "stream consumer gone, stopping");
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta_extracts_text() {
        let data = json!({
            "choices": [ { "delta": { "content": "hello" } } ]
        });
        assert_eq!(content_delta(&data), Some("hello"));
    }

    #[test]
    fn content_delta_ignores_empty_and_missing() {
        let empty = json!({ "choices": [ { "delta": { "content": "" } } ] });
        assert_eq!(content_delta(&empty), None);
        let role_only = json!({ "choices": [ { "delta": { "role": "assistant" } } ] });
        assert_eq!(content_delta(&role_only), None);
        let usage_only = json!({ "usage": { "total_tokens": 7 } });
        assert_eq!(content_delta(&usage_only), None);
    }
}
