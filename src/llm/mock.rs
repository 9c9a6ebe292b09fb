//! Deterministic in-process model for tests and offline demos.
//!
//! Returns a fixed response regardless of temperature, streams it word
//! by word, and counts every `generate`/`stream` invocation so tests
//! can assert the safety gate short-circuited before the model.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::llm::{LlmClient, SamplingConfig};
use crate::prompt::Prompt;

pub struct MockLlm {
    response: String,
    classifier_reply: String,
    generate_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    stream_failures: AtomicUsize,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self {
            response: "Speaking as the document: here is what I contain about that.".to_string(),
            classifier_reply: "YES".to_string(),
            generate_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            stream_failures: AtomicUsize::new(0),
        }
    }
}

impl MockLlm {
    pub fn with_response(response: &str) -> Self {
        Self {
            response: response.to_string(),
            ..Self::default()
        }
    }

    /// What the yes/no relevance classifier should answer.
    pub fn with_classifier_reply(mut self, reply: &str) -> Self {
        self.classifier_reply = reply.to_string();
        self
    }

    /// Make the next `count` stream calls fail with a retryable
    /// connection error before producing any output.
    pub fn with_stream_failures(self, count: usize) -> Self {
        self.stream_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Total model invocations of either kind.
    pub fn total_calls(&self) -> usize {
        self.generate_calls() + self.stream_calls()
    }

    fn reply_for(&self, prompt: &Prompt) -> String {
        // The relevance classifier asks a constrained yes/no question;
        // everything else gets the canned document answer.
        if prompt.user.ends_with("Answerable?") {
            self.classifier_reply.clone()
        } else {
            self.response.clone()
        }
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(
        &self,
        prompt: &Prompt,
        _sampling: &SamplingConfig,
    ) -> Result<String, LlmError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply_for(prompt))
    }

    async fn stream(
        &self,
        prompt: &Prompt,
        _sampling: &SamplingConfig,
        tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .stream_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LlmError::Connection {
                provider: "mock",
                message: "injected stream failure".to_string(),
            });
        }
        let text = self.reply_for(prompt);
        let mut first = true;
        for word in text.split(' ') {
            let fragment = if first {
                word.to_string()
            } else {
                format!(" {word}")
            };
            first = false;
            if tx.send(fragment).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Prompt;

    fn prompt(user: &str) -> Prompt {
        Prompt {
            system: "persona".to_string(),
            user: user.to_string(),
        }
    }

    fn sampling() -> SamplingConfig {
        SamplingConfig {
            temperature: 0.0,
            top_k: 4,
            max_tokens: 64,
        }
    }

    #[tokio::test]
    async fn stream_concatenates_to_generate_output() {
        let llm = MockLlm::default();
        let full = llm.generate(&prompt("question"), &sampling()).await.unwrap();

        // The channel is smaller than the fragment count, so the sender
        // blocks unless a consumer drains it concurrently.
        let (tx, mut rx) = mpsc::channel::<String>(4);
        let drain = tokio::spawn(async move {
            let mut streamed = String::new();
            while let Some(fragment) = rx.recv().await {
                streamed.push_str(&fragment);
            }
            streamed
        });
        llm.stream(&prompt("question"), &sampling(), tx).await.unwrap();
        let streamed = drain.await.unwrap();
        assert_eq!(streamed, full);
    }

    #[tokio::test]
    async fn counts_calls() {
        let llm = MockLlm::default();
        assert_eq!(llm.total_calls(), 0);
        llm.generate(&prompt("q"), &sampling()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        llm.stream(&prompt("q"), &sampling(), tx).await.unwrap();
        drain.await.unwrap();
        assert_eq!(llm.generate_calls(), 1);
        assert_eq!(llm.stream_calls(), 1);
    }

    #[tokio::test]
    async fn classifier_prompts_get_classifier_reply() {
        let llm = MockLlm::default().with_classifier_reply("NO");
        let reply = llm
            .generate(&prompt("Excerpts...\n\nQuestion: hm\n\nAnswerable?"), &sampling())
            .await
            .unwrap();
        assert_eq!(reply, "NO");
    }
}
