//! Top-K retrieval with relevance metrics.
//!
//! Embeds the question, queries the vector store, and summarizes the
//! returned similarities into [`RelevanceMetrics`] for the safety gate
//! and for diagnostics. The zero-result case is not an error: an empty
//! collection or an unmatched question yields an empty chunk list with
//! `no_match` set.

use std::sync::Arc;

use crate::embedding::{embed_query, Embedder};
use crate::error::QueryError;
use crate::store::{ScoredChunk, VectorStore};

/// Summary of how well the retrieved set matches a question.
///
/// Scores follow the crate-wide convention: similarity, higher = better.
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceMetrics {
    /// Best (highest) similarity in the retrieved set.
    pub best_score: f32,
    /// Mean similarity over the retrieved set.
    pub average_score: f32,
    /// Per-chunk similarities in rank order.
    pub per_chunk_scores: Vec<f32>,
    /// True when nothing was retrieved at all.
    pub no_match: bool,
}

impl RelevanceMetrics {
    pub fn no_match() -> Self {
        Self {
            best_score: 0.0,
            average_score: 0.0,
            per_chunk_scores: Vec::new(),
            no_match: true,
        }
    }

    pub fn from_scores(scores: Vec<f32>) -> Self {
        if scores.is_empty() {
            return Self::no_match();
        }
        let best = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let average = scores.iter().sum::<f32>() / scores.len() as f32;
        Self {
            best_score: best,
            average_score: average,
            per_chunk_scores: scores,
            no_match: false,
        }
    }
}

/// Queries the vector store for the chunks most relevant to a question.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    collection: String,
    top_k: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        collection: String,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            collection,
            top_k,
        }
    }

    /// Retrieve the top-K chunks for `question`, ranked best first.
    pub async fn retrieve(
        &self,
        question: &str,
    ) -> Result<(Vec<ScoredChunk>, RelevanceMetrics), QueryError> {
        let query_vector = embed_query(self.embedder.as_ref(), question).await?;
        let chunks = self
            .store
            .query(&self.collection, &query_vector, self.top_k)
            .await?;

        let metrics = RelevanceMetrics::from_scores(chunks.iter().map(|c| c.score).collect());
        tracing::debug!(
            question_chars = question.len(),
            retrieved = chunks.len(),
            best = metrics.best_score,
            avg = metrics.average_score,
            "retrieval complete"
        );
        Ok((chunks, metrics))
    }
}
