//! Language model provider abstraction.
//!
//! One trait, three backends:
//! - [`openai_compat::OpenAiCompatClient`] — OpenAI and Mistral, which
//!   share the chat-completions wire format (one client, two vendor
//!   presets).
//! - [`ollama::OllamaClient`] — a local Ollama runtime.
//! - [`mock::MockLlm`] — deterministic canned responses with call
//!   counters, for tests and offline demos.
//!
//! # Streaming contract
//!
//! `stream` pushes text fragments into a caller-supplied
//! `mpsc::Sender`. The channel the session layer creates is **bounded**,
//! so a slow consumer exerts backpressure by simply not receiving: the
//! provider's `send().await` parks until a slot frees up, and the
//! provider never reads further ahead of the consumer than the channel
//! capacity. A dropped receiver makes `send` fail; providers treat that
//! as cancellation, stop promptly, and drop the HTTP response (which
//! releases the connection). Fully consuming a stream yields exactly
//! the text `generate` would have returned for a deterministic model.

pub mod mock;
pub mod ollama;
pub mod openai_compat;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{ConfigError, LlmError};
use crate::prompt::Prompt;

/// Generation parameters passed to every call.
#[derive(Debug, Clone, Copy)]
pub struct SamplingConfig {
    /// Randomness, `0.0..=1.0`. Zero is deterministic for providers
    /// that honor it.
    pub temperature: f32,
    /// Retrieval depth of the originating query. Not a sampling knob;
    /// carried for logging only.
    pub top_k: usize,
    /// Output length cap in tokens.
    pub max_tokens: u32,
}

impl SamplingConfig {
    pub fn from_config(config: &LlmConfig, top_k: usize) -> Self {
        Self {
            temperature: config.temperature,
            top_k,
            max_tokens: config.max_tokens,
        }
    }
}

/// Uniform interface over the interchangeable model backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Blocking completion: the full response text.
    async fn generate(&self, prompt: &Prompt, sampling: &SamplingConfig)
        -> Result<String, LlmError>;

    /// Streamed completion: text fragments pushed into `tx` as they
    /// arrive. Returns when the response is complete, the receiver is
    /// dropped, or the provider fails.
    async fn stream(
        &self,
        prompt: &Prompt,
        sampling: &SamplingConfig,
        tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError>;

    /// Model identifier used for logging.
    fn model_name(&self) -> &str;
}

/// Instantiate the configured backend.
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, ConfigError> {
    match config.provider {
        LlmProvider::OpenAi => Ok(Arc::new(openai_compat::OpenAiCompatClient::openai(config)?)),
        LlmProvider::Mistral => Ok(Arc::new(openai_compat::OpenAiCompatClient::mistral(config)?)),
        LlmProvider::Ollama => Ok(Arc::new(ollama::OllamaClient::new(config))),
        LlmProvider::Mock => Ok(Arc::new(mock::MockLlm::default())),
    }
}
