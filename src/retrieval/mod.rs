//! Retrieval stage
//!
//! Embeds the query, asks the similarity index for candidates, drops
//! anything under the score floor and ranks the rest.

use crate::config::RetrievalConfig;
use crate::error::OrchestrationError;
use crate::models::{Chunk, Query, RetrievedChunk};
use crate::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

pub mod embedding;
pub mod memory;

pub use embedding::HashingEmbedder;
pub use memory::{load_corpus, InMemoryIndex};

/// One ranked match from the index.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

/// Turns text into a vector in the index's embedding space.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Read-only similarity index. Identical inputs against an unchanged
/// index must produce identical ordering.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<IndexHit>>;
}

pub struct Retriever {
    index: Arc<dyn SimilarityIndex>,
    embedder: Arc<dyn Embedder>,
    max_k: usize,
    min_score: f32,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn SimilarityIndex>,
        embedder: Arc<dyn Embedder>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            max_k: config.max_k.max(1),
            min_score: config.min_score,
        }
    }

    pub fn clamp_k(&self, k: usize) -> usize {
        k.clamp(1, self.max_k)
    }

    /// Top-k chunks above the score floor, best first.
    ///
    /// An empty result is a valid answer, not an error.
    pub async fn retrieve(&self, query: &Query, k: usize) -> Result<Vec<RetrievedChunk>> {
        let k = self.clamp_k(k);

        let embedding = self
            .embedder
            .embed(&query.text)
            .await
            .map_err(as_unavailable)?;

        let hits = self
            .index
            .search(&embedding, k)
            .await
            .map_err(as_unavailable)?;
        let returned = hits.len();

        let mut kept: Vec<IndexHit> = hits
            .into_iter()
            .filter(|hit| hit.score.is_finite() && hit.score >= self.min_score)
            .collect();

        // sort_by is stable: equal scores keep the index's own order
        kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        kept.truncate(k);

        debug!(
            query_id = %query.query_id,
            k,
            returned,
            kept = kept.len(),
            min_score = self.min_score,
            "Retrieval complete"
        );

        Ok(kept
            .into_iter()
            .enumerate()
            .map(|(i, hit)| RetrievedChunk {
                chunk: hit.chunk,
                score: hit.score,
                rank: i + 1,
            })
            .collect())
    }
}

fn as_unavailable(err: OrchestrationError) -> OrchestrationError {
    match err {
        OrchestrationError::RetrievalUnavailable(_) => err,
        other => OrchestrationError::RetrievalUnavailable(other.to_string()),
    }
}
