//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and two concrete backends:
//! - **[`OpenAiEmbedder`]** — batched calls to the OpenAI embeddings API.
//! - **[`HashEmbedder`]** — deterministic local feature-hashing embedder;
//!   no network, no model files. Used for offline runs and tests.
//!
//! Providers never retry on their own: a failed call surfaces an
//! [`EmbeddingError`] with a `retryable` flag and the session layer
//! decides the retry policy.
//!
//! Also provides the vector math used by the local store and the
//! retriever: [`cosine_similarity`], [`dot_product`], [`euclidean_distance`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{ConfigError, EmbeddingError};

/// A backend that maps text to fixed-dimension vectors.
///
/// All vectors returned by one embedder have exactly [`dims`](Embedder::dims)
/// components; the vector store enforces this against its collection.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Output dimensionality, fixed per model.
    fn dims(&self) -> usize;

    /// Model identifier, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let mut vectors = embedder.embed(std::slice::from_ref(&text.to_string())).await?;
    vectors.pop().ok_or(EmbeddingError::CountMismatch {
        provider: "unknown",
        expected: 1,
        got: 0,
    })
}

/// Instantiate the configured embedding backend.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, ConfigError> {
    match config.provider {
        EmbeddingProvider::OpenAi => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbedder::new(config.dims))),
    }
}

// ============ OpenAI provider ============

const OPENAI_PROVIDER: &str = "openai";

/// Remote embedder calling `POST /v1/embeddings`.
///
/// Requires `OPENAI_API_KEY` in the environment. Batches are sized by
/// the caller; this type sends exactly what it is given.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| ConfigError::MissingEnv("OPENAI_API_KEY"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|_| ConfigError::MissingField {
                provider: OPENAI_PROVIDER,
                field: "http client",
            })?;
        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::Request {
                provider: OPENAI_PROVIDER,
                message: e.to_string(),
                // Connect/timeout failures are transient; the caller may retry.
                retryable: true,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(EmbeddingError::Auth {
                    provider: OPENAI_PROVIDER,
                    message: text,
                });
            }
            return Err(EmbeddingError::Request {
                provider: OPENAI_PROVIDER,
                message: format!("HTTP {status}: {text}"),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| EmbeddingError::Response {
            provider: OPENAI_PROVIDER,
            message: e.to_string(),
        })?;

        let vectors = parse_openai_embeddings(&json)?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                provider: OPENAI_PROVIDER,
                expected: texts.len(),
                got: vectors.len(),
            });
        }
        Ok(vectors)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn parse_openai_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Response {
            provider: OPENAI_PROVIDER,
            message: "missing data array".to_string(),
        })?;

    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::Response {
                provider: OPENAI_PROVIDER,
                message: "missing embedding field".to_string(),
            })?;
        vectors.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(vectors)
}

// ============ Local hash provider ============

/// Deterministic local embedder using feature hashing.
///
/// Each whitespace/punctuation-delimited token is hashed into one of
/// `dims` buckets; the resulting count vector is L2-normalized. Texts
/// sharing vocabulary land near each other under the cosine metric,
/// which is enough for offline use and for exercising the full
/// retrieval path in tests without a model.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().unwrap()) as usize % self.dims;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "hash"
    }
}

// ============ Vector math ============

/// Cosine similarity in `[-1.0, 1.0]`; higher = more similar.
/// Returns `0.0` for empty or mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Plain dot product; higher = more similar.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Euclidean (L2) distance; lower = more similar. The store negates
/// this before returning it so that every score crossing a module
/// boundary is a similarity.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let texts = vec!["storage engines and compaction".to_string()];
        let a = embedder.embed(&texts).await.unwrap();
        let b = embedder.embed(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }

    #[tokio::test]
    async fn hash_embedder_vectors_are_normalized() {
        let embedder = HashEmbedder::new(128);
        let out = embedder
            .embed(&["some words to hash".to_string()])
            .await
            .unwrap();
        let norm: f32 = out[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated() {
        let embedder = HashEmbedder::new(256);
        let out = embedder
            .embed(&[
                "rust memory safety borrow checker".to_string(),
                "rust borrow checker and memory".to_string(),
                "medieval cooking recipes for soup".to_string(),
            ])
            .await
            .unwrap();
        let related = cosine_similarity(&out[0], &out[1]);
        let unrelated = cosine_similarity(&out[0], &out[2]);
        assert!(related > unrelated);
    }

    #[test]
    fn cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn euclidean_zero_for_identical() {
        let v = vec![0.5, -1.5, 2.0];
        assert!(euclidean_distance(&v, &v) < 1e-6);
    }

    #[test]
    fn parse_openai_shape() {
        let json = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]},
            ]
        });
        let vectors = parse_openai_embeddings(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.3f32, 0.4f32]);
    }

    #[test]
    fn parse_openai_missing_data_is_error() {
        let json = serde_json::json!({"oops": true});
        assert!(parse_openai_embeddings(&json).is_err());
    }
}
