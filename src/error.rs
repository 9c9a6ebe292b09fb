//! Typed errors for every stage of the pipeline.
//!
//! Each subsystem gets its own enum so callers can match on exactly the
//! failures they can handle. Transient failures (rate limits, connection
//! drops) expose a `retryable()` predicate; the session layer is the only
//! place that loops on them. Safety verdicts are *not* errors — an
//! off-topic or injected question is a normal turn outcome.

use std::path::PathBuf;

/// Invalid configuration, rejected before any work starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({chunk_size})")]
    ChunkOverlap { chunk_size: usize, overlap: usize },

    #[error("{field} must be positive")]
    NonPositive { field: &'static str },

    #[error("temperature {value} out of range, expected 0.0..=1.0")]
    TemperatureRange { value: f32 },

    #[error("unknown {kind} provider: '{name}'")]
    UnknownProvider { kind: &'static str, name: String },

    #[error("missing setting '{field}' required by provider '{provider}'")]
    MissingField {
        provider: &'static str,
        field: &'static str,
    },

    #[error("environment variable '{0}' not set")]
    MissingEnv(&'static str),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// The input document could not be turned into text.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("cannot read document {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported document type '{extension}' for {path}")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("failed to extract text from {path}: {message}")]
    Extraction { path: PathBuf, message: String },

    #[error("document {path} contains no extractable text")]
    Empty { path: PathBuf },
}

/// An embedding provider call failed.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding request to {provider} failed: {message}")]
    Request {
        provider: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("{provider} returned a malformed embedding response: {message}")]
    Response {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} returned {got} vectors for {expected} inputs")]
    CountMismatch {
        provider: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("authentication failed for {provider}: {message}")]
    Auth {
        provider: &'static str,
        message: String,
    },
}

impl EmbeddingError {
    pub fn retryable(&self) -> bool {
        matches!(self, EmbeddingError::Request { retryable: true, .. })
    }
}

/// Vector store failures, split by recoverability.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Dimension/metric mismatch against the collection. Never retryable:
    /// retrying would corrupt the index.
    #[error("collection '{collection}' configured for {expected} dims, got vector of {got}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        got: usize,
    },

    #[error("collection '{collection}' uses metric {expected}, session configured {got}")]
    MetricMismatch {
        collection: String,
        expected: String,
        got: String,
    },

    /// Transient connectivity failure to a server-mode backend.
    #[error("vector store connection failed: {message}")]
    Connection { message: String },

    #[error("vector store backend error: {message}")]
    Backend { message: String },

    #[error("vector store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::Connection { .. })
    }
}

/// A language model call failed.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider} request failed: {message}")]
    Request {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} returned an unparseable response: {message}")]
    Parse {
        provider: &'static str,
        message: String,
    },

    #[error("authentication failed for {provider}: {message}")]
    Auth {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} rate limited the request")]
    RateLimited { provider: &'static str },

    #[error("{provider} call timed out after {timeout_secs}s")]
    Timeout {
        provider: &'static str,
        timeout_secs: u64,
    },

    #[error("connection to {provider} failed: {message}")]
    Connection {
        provider: &'static str,
        message: String,
    },

    #[error("stream from {provider} broke mid-response: {message}")]
    Streaming {
        provider: &'static str,
        message: String,
    },
}

impl LlmError {
    /// Which provider produced the error.
    pub fn provider(&self) -> &'static str {
        match self {
            LlmError::Request { provider, .. }
            | LlmError::Parse { provider, .. }
            | LlmError::Auth { provider, .. }
            | LlmError::RateLimited { provider }
            | LlmError::Timeout { provider, .. }
            | LlmError::Connection { provider, .. }
            | LlmError::Streaming { provider, .. } => provider,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Timeout { .. }
                | LlmError::Connection { .. }
                | LlmError::Streaming { .. }
        )
    }
}

/// Anything that can go wrong while opening a session (document load,
/// chunking, embedding, indexing). Ingestion is all-or-nothing: any of
/// these leaves the session in the `Failed` state.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Anything that can go wrong while answering a question. The session
/// always returns to `Ready` after one of these; conversation memory is
/// left exactly as it was before the failing turn.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("another query is already in flight for this session")]
    Busy,

    #[error("session is not ready for queries (state: {state})")]
    NotReady { state: String },
}

impl QueryError {
    pub fn retryable(&self) -> bool {
        match self {
            QueryError::Embedding(e) => e.retryable(),
            QueryError::Store(e) => e.retryable(),
            QueryError::Llm(e) => e.retryable(),
            QueryError::Busy | QueryError::NotReady { .. } => false,
        }
    }
}
