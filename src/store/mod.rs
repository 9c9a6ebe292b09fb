//! Vector store abstraction.
//!
//! A [`VectorStore`] persists `(embedding, chunk)` pairs in named
//! collections and answers nearest-neighbor queries. Two backends:
//!
//! - [`local::LocalStore`] — embedded, one JSON file per collection
//!   under a persist directory; brute-force scored search in memory.
//! - [`qdrant::QdrantStore`] — client-server over the Qdrant REST API.
//!
//! Score convention (pinned, see DESIGN.md): every score returned by
//! [`VectorStore::query`] is a **similarity — higher is better** — for
//! all three metrics. Both backends negate Euclidean distances on the
//! way out; cosine and dot scores are similarities as reported.
//!
//! Collection configuration (dimension, metric) is fixed at creation.
//! An upsert whose vectors disagree with the collection fails fast with
//! [`StoreError::DimensionMismatch`] rather than corrupting the index.
//! Upserts are clear-then-insert: re-ingesting a document can never
//! duplicate its chunks.

pub mod local;
pub mod qdrant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::config::{DistanceMetric, StoreProvider, VectorStoreConfig};
use crate::error::{ConfigError, StoreError};

/// Fixed-at-creation collection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub dims: usize,
    pub metric: DistanceMetric,
}

/// A retrieved chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Similarity; higher = more similar, regardless of metric.
    pub score: f32,
}

/// Uniform interface over the swappable vector store backends.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace the contents of `collection` with the given chunks and
    /// vectors. Clears any previous entries first (idempotent with
    /// respect to document identity). `chunks` and `vectors` are
    /// parallel; every vector must have `cfg.dims` components.
    async fn upsert(
        &self,
        collection: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        cfg: CollectionConfig,
    ) -> Result<(), StoreError>;

    /// Top-`top_k` most similar chunks, best first.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError>;

    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError>;
}

/// Instantiate the configured backend.
pub fn create_store(config: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>, ConfigError> {
    match config.provider {
        StoreProvider::Local => Ok(Arc::new(local::LocalStore::new(&config.persist_dir))),
        StoreProvider::Qdrant => Ok(Arc::new(qdrant::QdrantStore::new(
            &config.server_url,
            config.timeout_secs,
        ))),
    }
}

pub(crate) fn check_dims(
    collection: &str,
    expected: usize,
    vectors: &[Vec<f32>],
) -> Result<(), StoreError> {
    for v in vectors {
        if v.len() != expected {
            return Err(StoreError::DimensionMismatch {
                collection: collection.to_string(),
                expected,
                got: v.len(),
            });
        }
    }
    Ok(())
}
