//! docvoice — talk to your documents, and let them answer back.
//!
//! A retrieval-augmented pipeline that gives an uploaded document a
//! first-person voice: the document is chunked, embedded, and indexed,
//! and every question is answered *as the document*, grounded in its
//! own retrieved excerpts.
//!
//! ```text
//!   load_document ─▶ chunk_text ─▶ Embedder ─▶ VectorStore
//!                                                   │
//!   question ─▶ safety gate ─▶ Retriever ◀──────────┘
//!                   │              │
//!                   ▼              ▼
//!              templated       prompt::compose ─▶ LlmClient
//!              responses                              │
//!                   └──────────▶ Session ◀────────────┘
//! ```
//!
//! Modules:
//! - [`config`] — TOML-backed configuration with defaults for every field
//! - [`document`] — loading text, markdown, JSON, and PDF files
//! - [`chunk`] — boundary-aware overlapping text chunking
//! - [`embedding`] — the [`embedding::Embedder`] trait and its providers
//! - [`store`] — the [`store::VectorStore`] trait, local and qdrant backends
//! - [`retrieve`] — top-k retrieval plus [`retrieve::RelevanceMetrics`]
//! - [`safety`] — injection and topic-relevance screening
//! - [`prompt`] — persona templates and budgeted prompt assembly
//! - [`llm`] — the [`llm::LlmClient`] trait, cloud and local providers
//! - [`session`] — the per-document conversation state machine
//!
//! The usual entry point is [`session::Session::open`] followed by
//! [`session::Session::ask`] or [`session::Session::ask_streaming`].

pub mod chunk;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod prompt;
pub mod retrieve;
pub mod safety;
pub mod session;
pub mod store;

pub use config::SessionConfig;
pub use error::{QueryError, SessionError};
pub use session::{Answer, AnswerStream, Session, SessionState};
