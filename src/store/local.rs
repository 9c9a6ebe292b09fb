//! Embedded vector store.
//!
//! Each collection is one JSON file under the persist directory,
//! holding the collection config and its `(chunk, vector)` rows.
//! Search is a brute-force scan scored by the collection's metric,
//! which is plenty for single-document sessions.
//!
//! Concurrency: collections live behind a `tokio::sync::RwLock` — many
//! concurrent readers across sessions, one writer per upsert. Writes
//! persist to disk before the lock is released, so a crash between
//! sessions never leaves a half-written index visible (write to a temp
//! file, then rename).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::chunk::Chunk;
use crate::config::DistanceMetric;
use crate::embedding::{cosine_similarity, dot_product, euclidean_distance};
use crate::error::StoreError;
use crate::store::{check_dims, CollectionConfig, ScoredChunk, VectorStore};

use async_trait::async_trait;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    id: String,
    text: String,
    start: usize,
    end: usize,
    index: usize,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCollection {
    config: CollectionConfig,
    rows: Vec<StoredRow>,
}

/// Embedded, file-persisted vector store.
pub struct LocalStore {
    persist_dir: PathBuf,
    collections: RwLock<HashMap<String, StoredCollection>>,
}

impl LocalStore {
    pub fn new(persist_dir: &Path) -> Self {
        Self {
            persist_dir: persist_dir.to_path_buf(),
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.persist_dir.join(format!("{collection}.json"))
    }

    fn load_from_disk(&self, collection: &str) -> Result<Option<StoredCollection>, StoreError> {
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let stored = serde_json::from_str(&raw).map_err(|e| StoreError::Backend {
            message: format!("corrupt collection file {}: {e}", path.display()),
        })?;
        Ok(Some(stored))
    }

    fn persist(&self, collection: &str, stored: &StoredCollection) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.persist_dir).map_err(|source| StoreError::Io {
            path: self.persist_dir.clone(),
            source,
        })?;
        let path = self.collection_path(collection);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string(stored).map_err(|e| StoreError::Backend {
            message: e.to_string(),
        })?;
        std::fs::write(&tmp, raw).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })?;
        Ok(())
    }

    /// Fetch a collection, falling back to disk on a cold cache.
    async fn get_collection(&self, collection: &str) -> Result<Option<StoredCollection>, StoreError> {
        {
            let cache = self.collections.read().await;
            if let Some(stored) = cache.get(collection) {
                return Ok(Some(stored.clone()));
            }
        }
        match self.load_from_disk(collection)? {
            Some(stored) => {
                let mut cache = self.collections.write().await;
                cache.insert(collection.to_string(), stored.clone());
                Ok(Some(stored))
            }
            None => Ok(None),
        }
    }
}

fn score(metric: DistanceMetric, query: &[f32], row: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => cosine_similarity(query, row),
        DistanceMetric::Dot => dot_product(query, row),
        // Negated so higher = more similar, matching the other metrics.
        DistanceMetric::Euclidean => -euclidean_distance(query, row),
    }
}

#[async_trait]
impl VectorStore for LocalStore {
    async fn upsert(
        &self,
        collection: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        cfg: CollectionConfig,
    ) -> Result<(), StoreError> {
        if chunks.len() != vectors.len() {
            return Err(StoreError::Backend {
                message: format!(
                    "{} chunks but {} vectors for collection '{collection}'",
                    chunks.len(),
                    vectors.len()
                ),
            });
        }
        check_dims(collection, cfg.dims, vectors)?;

        // An existing collection keeps its creation-time config; a
        // mismatched re-open is a configuration error, not a rebuild.
        if let Some(existing) = self.get_collection(collection).await? {
            if existing.config.dims != cfg.dims {
                return Err(StoreError::DimensionMismatch {
                    collection: collection.to_string(),
                    expected: existing.config.dims,
                    got: cfg.dims,
                });
            }
            if existing.config.metric != cfg.metric {
                return Err(StoreError::MetricMismatch {
                    collection: collection.to_string(),
                    expected: existing.config.metric.to_string(),
                    got: cfg.metric.to_string(),
                });
            }
        }

        let rows = chunks
            .iter()
            .zip(vectors.iter())
            .map(|(c, v)| StoredRow {
                id: c.id.clone(),
                text: c.text.clone(),
                start: c.start,
                end: c.end,
                index: c.index,
                vector: v.clone(),
            })
            .collect();
        let stored = StoredCollection { config: cfg, rows };

        let mut cache = self.collections.write().await;
        self.persist(collection, &stored)?;
        // Replace, not extend: prior entries for this document are gone.
        cache.insert(collection.to_string(), stored);
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let Some(stored) = self.get_collection(collection).await? else {
            return Ok(Vec::new());
        };

        if vector.len() != stored.config.dims {
            return Err(StoreError::DimensionMismatch {
                collection: collection.to_string(),
                expected: stored.config.dims,
                got: vector.len(),
            });
        }

        let mut results: Vec<ScoredChunk> = stored
            .rows
            .iter()
            .map(|row| ScoredChunk {
                chunk: Chunk {
                    id: row.id.clone(),
                    text: row.text.clone(),
                    start: row.start,
                    end: row.end,
                    index: row.index,
                },
                score: score(stored.config.metric, vector, &row.vector),
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(self.get_collection(collection).await?.is_some())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError> {
        let mut cache = self.collections.write().await;
        cache.remove(collection);
        let path = self.collection_path(collection);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(index: usize, text: &str) -> Chunk {
        Chunk {
            id: format!("c{index}"),
            text: text.to_string(),
            start: 0,
            end: text.len(),
            index,
        }
    }

    fn cfg() -> CollectionConfig {
        CollectionConfig {
            dims: 3,
            metric: DistanceMetric::Cosine,
        }
    }

    #[tokio::test]
    async fn upsert_then_query_ranks_by_similarity() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let chunks = vec![chunk(0, "alpha"), chunk(1, "beta"), chunk(2, "gamma")];
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.9, 0.1, 0.0],
        ];
        store.upsert("doc", &chunks, &vectors, cfg()).await.unwrap();

        let results = store.query("doc", &[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.text, "alpha");
        assert_eq!(results[1].chunk.text, "gamma");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn reupsert_replaces_instead_of_appending() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let chunks = vec![chunk(0, "one"), chunk(1, "two")];
        let vectors = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
        store.upsert("doc", &chunks, &vectors, cfg()).await.unwrap();
        store.upsert("doc", &chunks, &vectors, cfg()).await.unwrap();

        let results = store.query("doc", &[1.0, 0.0, 0.0], 10).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let chunks = vec![chunk(0, "one")];
        let bad = vec![vec![1.0, 0.0]]; // 2 dims against a 3-dim config
        let err = store.upsert("doc", &chunks, &bad, cfg()).await.unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn reopening_with_different_dims_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let chunks = vec![chunk(0, "one")];
        store
            .upsert("doc", &chunks, &[vec![1.0, 0.0, 0.0]], cfg())
            .await
            .unwrap();

        let other = CollectionConfig {
            dims: 2,
            metric: DistanceMetric::Cosine,
        };
        let err = store
            .upsert("doc", &chunks, &[vec![1.0, 0.0]], other)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn query_missing_collection_is_empty_not_error() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let results = store.query("nope", &[1.0, 0.0, 0.0], 4).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn persists_across_store_instances() {
        let tmp = TempDir::new().unwrap();
        {
            let store = LocalStore::new(tmp.path());
            let chunks = vec![chunk(0, "persisted")];
            store
                .upsert("doc", &chunks, &[vec![0.0, 1.0, 0.0]], cfg())
                .await
                .unwrap();
        }
        let reopened = LocalStore::new(tmp.path());
        assert!(reopened.collection_exists("doc").await.unwrap());
        let results = reopened.query("doc", &[0.0, 1.0, 0.0], 1).await.unwrap();
        assert_eq!(results[0].chunk.text, "persisted");
    }

    #[tokio::test]
    async fn delete_collection_removes_file_and_cache() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let chunks = vec![chunk(0, "bye")];
        store
            .upsert("doc", &chunks, &[vec![1.0, 0.0, 0.0]], cfg())
            .await
            .unwrap();
        store.delete_collection("doc").await.unwrap();
        assert!(!store.collection_exists("doc").await.unwrap());
    }

    #[tokio::test]
    async fn euclidean_scores_are_negated_distances() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let euclid = CollectionConfig {
            dims: 2,
            metric: DistanceMetric::Euclidean,
        };
        let chunks = vec![chunk(0, "near"), chunk(1, "far")];
        let vectors = vec![vec![1.0, 0.0], vec![10.0, 10.0]];
        store.upsert("doc", &chunks, &vectors, euclid).await.unwrap();

        let results = store.query("doc", &[1.0, 0.0], 2).await.unwrap();
        // Nearest first, and both scores non-positive (negated distances).
        assert_eq!(results[0].chunk.text, "near");
        assert!(results[0].score > results[1].score);
        assert!(results[0].score <= 0.0);
    }
}
