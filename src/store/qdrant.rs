//! Client-server vector store backed by the Qdrant REST API.
//!
//! Talks plain HTTP to a Qdrant node: collection management via
//! `PUT/DELETE /collections/{name}`, point upload via
//! `PUT /collections/{name}/points`, search via
//! `POST /collections/{name}/points/search`. Chunk fields ride along as
//! point payload so query results reconstruct full [`Chunk`]s.
//!
//! Connection-level failures map to [`StoreError::Connection`] and are
//! retryable by the session layer; HTTP-level rejections are
//! [`StoreError::Backend`] and are not.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::chunk::Chunk;
use crate::config::DistanceMetric;
use crate::error::StoreError;
use crate::store::{check_dims, CollectionConfig, ScoredChunk, VectorStore};

pub struct QdrantStore {
    base_url: String,
    client: reqwest::Client,
}

impl QdrantStore {
    pub fn new(server_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Fetch the existing collection's vector params, if the collection
    /// exists.
    async fn collection_params(
        &self,
        collection: &str,
    ) -> Result<Option<(usize, String)>, StoreError> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{collection}")))
            .send()
            .await
            .map_err(connection_error)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| StoreError::Backend {
            message: format!("unparseable collection info: {e}"),
        })?;
        let vectors = &body["result"]["config"]["params"]["vectors"];
        let size = vectors["size"].as_u64().unwrap_or(0) as usize;
        let distance = vectors["distance"].as_str().unwrap_or("").to_string();
        Ok(Some((size, distance)))
    }

    async fn create_collection(
        &self,
        collection: &str,
        cfg: CollectionConfig,
    ) -> Result<(), StoreError> {
        let body = json!({
            "vectors": {
                "size": cfg.dims,
                "distance": qdrant_distance(cfg.metric),
            }
        });
        let resp = self
            .client
            .put(self.url(&format!("/collections/{collection}")))
            .json(&body)
            .send()
            .await
            .map_err(connection_error)?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }
        Ok(())
    }
}

fn qdrant_distance(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Cosine => "Cosine",
        DistanceMetric::Dot => "Dot",
        DistanceMetric::Euclidean => "Euclid",
    }
}

/// Map a raw qdrant score onto the crate-wide similarity convention.
/// Cosine and dot scores are already similarities; Euclid is a distance
/// (lower = closer) and gets negated so higher always means closer.
fn similarity(distance: &str, raw: f32) -> f32 {
    if distance == "Euclid" {
        -raw
    } else {
        raw
    }
}

fn connection_error(e: reqwest::Error) -> StoreError {
    StoreError::Connection {
        message: e.to_string(),
    }
}

async fn backend_error(resp: reqwest::Response) -> StoreError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    StoreError::Backend {
        message: format!("HTTP {status}: {body}"),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
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

        // A persisted collection with a different dimension or metric is
        // a configuration error, surfaced before any data is touched.
        if let Some((size, distance)) = self.collection_params(collection).await? {
            if size != cfg.dims {
                return Err(StoreError::DimensionMismatch {
                    collection: collection.to_string(),
                    expected: size,
                    got: cfg.dims,
                });
            }
            if distance != qdrant_distance(cfg.metric) {
                return Err(StoreError::MetricMismatch {
                    collection: collection.to_string(),
                    expected: distance,
                    got: cfg.metric.to_string(),
                });
            }
            // Matching config: clear prior entries by recreating.
            self.delete_collection(collection).await?;
        }
        self.create_collection(collection, cfg).await?;

        let points: Vec<serde_json::Value> = chunks
            .iter()
            .zip(vectors.iter())
            .map(|(chunk, vector)| {
                json!({
                    "id": chunk.id,
                    "vector": vector,
                    "payload": {
                        "text": chunk.text,
                        "start": chunk.start,
                        "end": chunk.end,
                        "index": chunk.index,
                    }
                })
            })
            .collect();

        let resp = self
            .client
            .put(self.url(&format!("/collections/{collection}/points?wait=true")))
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(connection_error)?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }

        tracing::debug!(collection, points = chunks.len(), "qdrant upsert complete");
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        // The distance decides how raw scores map onto the crate-wide
        // similarity convention, so look it up before searching.
        let distance = match self.collection_params(collection).await? {
            Some((_, distance)) => distance,
            None => return Ok(Vec::new()),
        };

        let body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/search")))
            .json(&body)
            .send()
            .await
            .map_err(connection_error)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| StoreError::Backend {
            message: format!("unparseable search response: {e}"),
        })?;

        let hits = json["result"].as_array().cloned().unwrap_or_default();
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let payload = &hit["payload"];
            results.push(ScoredChunk {
                chunk: Chunk {
                    id: hit["id"].as_str().unwrap_or_default().to_string(),
                    text: payload["text"].as_str().unwrap_or_default().to_string(),
                    start: payload["start"].as_u64().unwrap_or(0) as usize,
                    end: payload["end"].as_u64().unwrap_or(0) as usize,
                    index: payload["index"].as_u64().unwrap_or(0) as usize,
                },
                score: similarity(&distance, hit["score"].as_f64().unwrap_or(0.0) as f32),
            });
        }
        // Re-rank after the sign adjustment; for Euclid the backend's
        // order (nearest first) would otherwise be reversed by a plain
        // descending sort over raw distances.
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(self.collection_params(collection).await?.is_some())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.url(&format!("/collections/{collection}")))
            .send()
            .await
            .map_err(connection_error)?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(backend_error(resp).await);
        }
        Ok(())
    }
}
