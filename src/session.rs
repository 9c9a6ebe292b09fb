//! The per-document conversation session: state machine, conversation
//! memory, and the turn pipeline tying every component together.
//!
//! One [`Session`] owns one indexed document. Turns run strictly one at
//! a time: a second concurrent question is rejected with
//! [`QueryError::Busy`] rather than queued, because conversation memory
//! mutation is not designed for interleaving. Independent sessions
//! share only the vector store backend, which supports concurrent
//! readers.
//!
//! Turn pipeline (`ask` / `ask_streaming`):
//! injection screen → retrieval → relevance screen (numeric threshold,
//! LLM yes/no fallback for the ambiguous band) → prompt composition →
//! generation → memory append. Off-topic and injection verdicts produce
//! templated in-persona answers and are recorded as normal turns; only
//! infrastructure failures surface as errors, and those always leave
//! memory untouched and the session back in `Ready`.
//!
//! Retryable provider errors are retried here — bounded attempts with
//! exponential backoff — never inside the providers themselves.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::chunk::chunk_text;
use crate::config::{RetryConfig, SessionConfig};
use crate::document::load_document;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{EmbeddingError, LlmError, QueryError, SessionError, StoreError};
use crate::llm::{create_llm, LlmClient, SamplingConfig};
use crate::prompt::{self, Prompt, DOCUMENT_PERSONA, INJECTION_RESPONSE, OFF_TOPIC_RESPONSE};
use crate::retrieve::{RelevanceMetrics, Retriever};
use crate::safety::{
    classify_answerable, screen_injection, screen_relevance, RelevanceSignal, SafetyVerdict,
};
use crate::store::{create_store, CollectionConfig, ScoredChunk, VectorStore};

/// Capacity of the fragment channel handed to streaming consumers.
/// The producer never runs further ahead of the consumer than this.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Ingesting,
    Ready,
    QueryInFlight,
    /// Unrecoverable ingest failure; the document is not queryable.
    Failed(String),
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Ingesting => f.write_str("ingesting"),
            SessionState::Ready => f.write_str("ready"),
            SessionState::QueryInFlight => f.write_str("query-in-flight"),
            SessionState::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Document,
}

/// One entry of conversation memory.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// The outcome of one blocking `ask`.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub verdict: SafetyVerdict,
    /// Retrieved chunks backing the answer, best first. Empty for
    /// off-topic and injection verdicts.
    pub sources: Vec<ScoredChunk>,
    pub metrics: RelevanceMetrics,
}

/// A streamed answer: text fragments until end-of-stream or an error.
///
/// Dropping the stream mid-flight cancels generation; a partially
/// consumed answer is not recorded in conversation memory.
pub struct AnswerStream {
    rx: mpsc::Receiver<Result<String, QueryError>>,
    pub verdict: SafetyVerdict,
}

impl AnswerStream {
    /// Next fragment, `None` at end-of-stream.
    pub async fn next(&mut self) -> Option<Result<String, QueryError>> {
        self.rx.recv().await
    }

    /// Drain the stream to completion, concatenating all fragments.
    pub async fn collect(mut self) -> Result<String, QueryError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            text.push_str(&item?);
        }
        Ok(text)
    }
}

struct Inner {
    state: SessionState,
    memory: Vec<Turn>,
}

/// A live conversation with one indexed document.
///
/// Created by [`Session::open`], which runs the full ingest pipeline
/// (load → chunk → embed → index) before returning; a handle that
/// exists is always queryable. There is no global state: everything the
/// state machine needs lives in this struct.
pub struct Session {
    config: SessionConfig,
    collection: String,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    inner: Arc<Mutex<Inner>>,
    /// Serializes turns; `try_lock` failure means a query is in flight.
    turn_guard: Arc<Mutex<()>>,
}

impl Session {
    /// Open a session over `path`: validate the configuration, then
    /// chunk, embed, and index the document. All-or-nothing — any
    /// component failure means no queryable session.
    pub async fn open(path: &Path, config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let embedder = create_embedder(&config.embedding)?;
        let store = create_store(&config.store)?;
        let llm = create_llm(&config.llm)?;
        Self::open_with(path, config, embedder, store, llm).await
    }

    /// Like [`Session::open`], but with the providers supplied by the
    /// caller instead of built from the configuration.
    pub async fn open_with(
        path: &Path,
        config: SessionConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let collection = collection_name(path, embedder.model_name());

        let session = Self {
            config,
            collection,
            embedder,
            store,
            llm,
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Idle,
                memory: Vec::new(),
            })),
            turn_guard: Arc::new(Mutex::new(())),
        };

        session.set_state(SessionState::Ingesting).await;
        match session.ingest(path).await {
            Ok(chunk_count) => {
                tracing::info!(
                    collection = %session.collection,
                    chunks = chunk_count,
                    "document indexed, session ready"
                );
                session.set_state(SessionState::Ready).await;
                Ok(session)
            }
            Err(e) => {
                session.set_state(SessionState::Failed(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn ingest(&self, path: &Path) -> Result<usize, SessionError> {
        let document = load_document(path)?;
        let chunks = chunk_text(
            &document.text,
            self.config.chunking.chunk_size,
            self.config.chunking.overlap,
        )?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embedding.batch_size) {
            let embedder = self.embedder.clone();
            let batch_owned: Vec<String> = batch.to_vec();
            let batch_vectors = with_retry(
                &self.config.retry,
                EmbeddingError::retryable,
                move || {
                    let embedder = embedder.clone();
                    let batch = batch_owned.clone();
                    async move { embedder.embed(&batch).await }
                },
            )
            .await?;
            vectors.extend(batch_vectors);
        }

        let collection_cfg = CollectionConfig {
            dims: self.config.embedding.dims,
            metric: self.config.store.metric,
        };
        let store = self.store.clone();
        let collection = self.collection.clone();
        let chunks_owned = chunks.clone();
        let vectors_owned = vectors.clone();
        with_retry(
            &self.config.retry,
            StoreError::retryable,
            move || {
                let store = store.clone();
                let collection = collection.clone();
                let chunks = chunks_owned.clone();
                let vectors = vectors_owned.clone();
                async move { store.upsert(&collection, &chunks, &vectors, collection_cfg).await }
            },
        )
        .await?;

        Ok(chunks.len())
    }

    /// Ask a question and wait for the complete answer.
    pub async fn ask(&self, question: &str) -> Result<Answer, QueryError> {
        let _guard = self.turn_guard.try_lock().map_err(|_| QueryError::Busy)?;
        self.require_ready().await?;

        self.set_state(SessionState::QueryInFlight).await;
        let result = self.run_turn(question).await;
        self.set_state(SessionState::Ready).await;
        result
    }

    async fn run_turn(&self, question: &str) -> Result<Answer, QueryError> {
        match self.screen(question).await? {
            Screened::Template(answer) => {
                self.append_turns(question, &answer.text).await;
                Ok(answer)
            }
            Screened::Proceed { chunks, metrics } => {
                let composed = self.compose(question, &chunks).await;
                let sampling =
                    SamplingConfig::from_config(&self.config.llm, self.config.retrieval.top_k);

                let llm = self.llm.clone();
                let text = with_retry(
                    &self.config.retry,
                    LlmError::retryable,
                    move || {
                        let llm = llm.clone();
                        let prompt = composed.clone();
                        async move { llm.generate(&prompt, &sampling).await }
                    },
                )
                .await?;

                self.append_turns(question, &text).await;
                Ok(Answer {
                    text,
                    verdict: SafetyVerdict::Relevant,
                    sources: chunks,
                    metrics,
                })
            }
        }
    }

    /// Ask a question and stream the answer as it is generated.
    ///
    /// Safety screening and retrieval happen before this returns, so
    /// verdicts and immediate failures surface here; generation errors
    /// arrive through the stream. The fragment channel is bounded:
    /// an unread stream stalls the producer rather than buffering.
    pub async fn ask_streaming(&self, question: &str) -> Result<AnswerStream, QueryError> {
        let guard = self
            .turn_guard
            .clone()
            .try_lock_owned()
            .map_err(|_| QueryError::Busy)?;
        self.require_ready().await?;
        self.set_state(SessionState::QueryInFlight).await;

        let screened = match self.screen(question).await {
            Ok(s) => s,
            Err(e) => {
                self.set_state(SessionState::Ready).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        match screened {
            Screened::Template(answer) => {
                // Templated verdicts stream as one fragment.
                self.append_turns(question, &answer.text).await;
                self.set_state(SessionState::Ready).await;
                let _ = tx.send(Ok(answer.text)).await;
                drop(guard);
                Ok(AnswerStream {
                    rx,
                    verdict: answer.verdict,
                })
            }
            Screened::Proceed { chunks, .. } => {
                let composed = self.compose(question, &chunks).await;
                let sampling =
                    SamplingConfig::from_config(&self.config.llm, self.config.retrieval.top_k);
                let llm = self.llm.clone();
                let inner = self.inner.clone();
                let retry = self.config.retry.clone();
                let question = question.to_string();

                tokio::spawn(async move {
                    // Guard moves into the producer: the session stays
                    // busy until the stream finishes or is abandoned.
                    let _guard = guard;
                    let outcome =
                        stream_with_retry(&retry, llm, composed, sampling, &tx).await;

                    let mut inner = inner.lock().await;
                    match outcome {
                        StreamOutcome::Complete(full_text) => {
                            // Full completion: record the turn pair.
                            inner.memory.push(Turn {
                                role: Role::User,
                                text: question,
                                timestamp: Utc::now(),
                            });
                            inner.memory.push(Turn {
                                role: Role::Document,
                                text: full_text,
                                timestamp: Utc::now(),
                            });
                        }
                        StreamOutcome::Abandoned => {
                            tracing::debug!("stream abandoned; turn not recorded");
                        }
                        StreamOutcome::Failed(e) => {
                            let _ = tx.send(Err(QueryError::from(e))).await;
                        }
                    }
                    inner.state = SessionState::Ready;
                });

                Ok(AnswerStream {
                    rx,
                    verdict: SafetyVerdict::Relevant,
                })
            }
        }
    }

    /// Retrieval diagnostics for a question. Does not consult the
    /// safety gate, call the model, or touch conversation memory.
    pub async fn relevance_metrics(&self, question: &str) -> Result<RelevanceMetrics, QueryError> {
        let (_, metrics) = self.retriever().retrieve(question).await?;
        Ok(metrics)
    }

    /// Clear conversation memory in place. The indexed document is
    /// untouched. Rejected while a query is in flight.
    pub async fn reset(&self) -> Result<(), QueryError> {
        let _guard = self.turn_guard.try_lock().map_err(|_| QueryError::Busy)?;
        let mut inner = self.inner.lock().await;
        inner.memory.clear();
        Ok(())
    }

    /// Release the session. The persisted collection is kept so a
    /// later session over the same document can reuse it.
    pub fn close(self) {}

    /// Release the session and delete its vector store collection.
    pub async fn close_and_purge(self) -> Result<(), StoreError> {
        self.store.delete_collection(&self.collection).await
    }

    /// Snapshot of conversation memory, oldest first.
    pub async fn memory(&self) -> Vec<Turn> {
        self.inner.lock().await.memory.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    // ----- internals -----

    fn retriever(&self) -> Retriever {
        Retriever::new(
            self.embedder.clone(),
            self.store.clone(),
            self.collection.clone(),
            self.config.retrieval.top_k,
        )
    }

    /// Run both safety screens. Returns either a templated answer
    /// (injection/off-topic) or the retrieved material for generation.
    async fn screen(&self, question: &str) -> Result<Screened, QueryError> {
        if screen_injection(question, &self.config.safety).is_some() {
            return Ok(Screened::Template(Answer {
                text: INJECTION_RESPONSE.to_string(),
                verdict: SafetyVerdict::InjectionDetected,
                sources: Vec::new(),
                metrics: RelevanceMetrics::no_match(),
            }));
        }

        let (chunks, metrics) = self.retriever().retrieve(question).await?;

        let signal = screen_relevance(&metrics, &self.config.safety);
        let relevant = match signal {
            RelevanceSignal::Clear => true,
            RelevanceSignal::OffTopic => false,
            RelevanceSignal::Ambiguous => {
                let context: String = chunks
                    .iter()
                    .map(|c| c.chunk.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n---\n");
                classify_answerable(self.llm.as_ref(), question, &context).await?
            }
        };

        if relevant {
            Ok(Screened::Proceed { chunks, metrics })
        } else {
            Ok(Screened::Template(Answer {
                text: OFF_TOPIC_RESPONSE.to_string(),
                verdict: SafetyVerdict::OffTopic,
                sources: Vec::new(),
                metrics,
            }))
        }
    }

    async fn compose(&self, question: &str, chunks: &[ScoredChunk]) -> Prompt {
        let memory = self.memory().await;
        prompt::compose(
            DOCUMENT_PERSONA,
            chunks,
            &memory,
            question,
            self.config.retrieval.history_window,
            self.config.retrieval.max_prompt_chars,
        )
    }

    async fn append_turns(&self, question: &str, answer: &str) {
        let mut inner = self.inner.lock().await;
        inner.memory.push(Turn {
            role: Role::User,
            text: question.to_string(),
            timestamp: Utc::now(),
        });
        inner.memory.push(Turn {
            role: Role::Document,
            text: answer.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn require_ready(&self) -> Result<(), QueryError> {
        let inner = self.inner.lock().await;
        match inner.state {
            SessionState::Ready => Ok(()),
            ref other => Err(QueryError::NotReady {
                state: other.to_string(),
            }),
        }
    }

    async fn set_state(&self, state: SessionState) {
        self.inner.lock().await.state = state;
    }
}

enum Screened {
    Template(Answer),
    Proceed {
        chunks: Vec<ScoredChunk>,
        metrics: RelevanceMetrics,
    },
}

enum StreamOutcome {
    Complete(String),
    Abandoned,
    Failed(LlmError),
}

/// Drive one generation stream, relaying fragments to the consumer.
///
/// A retryable failure before the first fragment has been forwarded is
/// retried with backoff like any other provider call. Once output has
/// reached the consumer the stream cannot be replayed, so later
/// failures surface through the channel instead.
async fn stream_with_retry(
    config: &RetryConfig,
    llm: Arc<dyn LlmClient>,
    prompt: Prompt,
    sampling: SamplingConfig,
    tx: &mpsc::Sender<Result<String, QueryError>>,
) -> StreamOutcome {
    let mut attempt = 0u32;
    loop {
        let (frag_tx, mut frag_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let producer = {
            let llm = llm.clone();
            let prompt = prompt.clone();
            tokio::spawn(async move { llm.stream(&prompt, &sampling, frag_tx).await })
        };

        let mut full_text = String::new();
        let mut abandoned = false;
        while let Some(fragment) = frag_rx.recv().await {
            full_text.push_str(&fragment);
            if tx.send(Ok(fragment)).await.is_err() {
                // Consumer dropped the stream: stop pulling; closing
                // frag_rx makes the provider stop.
                abandoned = true;
                break;
            }
        }
        drop(frag_rx);

        match producer.await {
            Ok(Ok(())) if abandoned => return StreamOutcome::Abandoned,
            Ok(Ok(())) => return StreamOutcome::Complete(full_text),
            Ok(Err(e)) => {
                let replayable = full_text.is_empty() && !abandoned;
                if replayable && e.retryable() && attempt < config.max_retries {
                    let backoff =
                        (config.initial_backoff_ms << attempt).min(config.max_backoff_ms);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max = config.max_retries,
                        backoff_ms = backoff,
                        error = %e,
                        "retrying stream after transient error"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                    continue;
                }
                return StreamOutcome::Failed(e);
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "stream producer panicked");
                return StreamOutcome::Abandoned;
            }
        }
    }
}

/// Collection name derived from document identity and embedding model,
/// so one document maps to one collection and switching embedders never
/// silently mixes vector spaces.
fn collection_name(path: &Path, embedding_model: &str) -> String {
    let canonical = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(embedding_model.as_bytes());
    let digest = hasher.finalize();
    format!("doc-{:x}", digest)[..20].to_string()
}

/// Run `op`, retrying transient failures with exponential backoff.
/// Non-retryable errors and exhausted attempts surface immediately.
pub(crate) async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) || attempt >= config.max_retries {
                    return Err(e);
                }
                let backoff = (config.initial_backoff_ms << attempt).min(config.max_backoff_ms);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff,
                    error = %e,
                    "retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn collection_name_is_stable_and_model_scoped() {
        let a = collection_name(Path::new("/tmp/a.txt"), "hash");
        let b = collection_name(Path::new("/tmp/a.txt"), "hash");
        let c = collection_name(Path::new("/tmp/a.txt"), "text-embedding-3-small");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("doc-"));
    }

    #[tokio::test]
    async fn with_retry_retries_transient_errors() {
        let calls = AtomicUsize::new(0);
        let cfg = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        };
        let result: Result<u32, LlmError> = with_retry(
            &cfg,
            |e: &LlmError| e.retryable(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(LlmError::RateLimited { provider: "mock" })
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_gives_up_on_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let cfg = RetryConfig::default();
        let result: Result<u32, LlmError> = with_retry(
            &cfg,
            |e: &LlmError| e.retryable(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(LlmError::Auth {
                        provider: "mock",
                        message: "bad key".to_string(),
                    })
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_bounds_attempts() {
        let calls = AtomicUsize::new(0);
        let cfg = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let result: Result<u32, LlmError> = with_retry(
            &cfg,
            |e: &LlmError| e.retryable(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::RateLimited { provider: "mock" }) }
            },
        )
        .await;
        assert!(result.is_err());
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
