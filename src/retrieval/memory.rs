//! In-memory similarity index
//!
//! Brute-force cosine scan over every stored vector. Suitable for the
//! curated corpora this service runs against; can be replaced with a
//! vector database behind the same trait.

use crate::error::OrchestrationError;
use crate::models::{Chunk, ChunkMetadata};
use crate::retrieval::{Embedder, IndexHit, SimilarityIndex};
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

struct IndexEntry {
    chunk: Arc<Chunk>,
    embedding: Vec<f32>,
}

pub struct InMemoryIndex {
    entries: Arc<RwLock<Vec<IndexEntry>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Embed and insert every chunk, in order.
    pub async fn from_chunks(chunks: Vec<Chunk>, embedder: &dyn Embedder) -> Result<Self> {
        let index = Self::new();
        for chunk in chunks {
            let embedding = embedder.embed(&chunk.text).await?;
            index.insert(chunk, embedding).await?;
        }
        Ok(index)
    }

    pub async fn insert(&self, chunk: Chunk, embedding: Vec<f32>) -> Result<()> {
        let mut entries = self.entries.write().await;

        if let Some(first) = entries.first() {
            if first.embedding.len() != embedding.len() {
                return Err(OrchestrationError::RetrievalUnavailable(format!(
                    "embedding for '{}' has {} dimensions, index uses {}",
                    chunk.chunk_id,
                    embedding.len(),
                    first.embedding.len()
                )));
            }
        }

        entries.push(IndexEntry {
            chunk: Arc::new(chunk),
            embedding,
        });
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimilarityIndex for InMemoryIndex {
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        let query_norm = norm(embedding);
        if query_norm == 0.0 || k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;

        let mut scored: Vec<IndexHit> = entries
            .iter()
            .filter(|entry| entry.embedding.len() == embedding.len())
            .map(|entry| IndexHit {
                chunk: Arc::clone(&entry.chunk),
                score: cosine_similarity(embedding, query_norm, &entry.embedding),
            })
            .collect();

        // Stable: equal scores stay in insertion order.
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(k);

        Ok(scored)
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_similarity(query: &[f32], query_norm: f32, stored: &[f32]) -> f32 {
    let stored_norm = norm(stored);
    if stored_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(stored).map(|(a, b)| a * b).sum();
    dot / (query_norm * stored_norm)
}

//
// ================= Corpus Loading =================
//

/// Chunk record as written by the ingestion pipeline.
#[derive(Debug, Deserialize)]
struct CorpusRecord {
    id: String,
    text: String,
    #[serde(default)]
    metadata: ChunkMetadata,
}

/// Load a JSON array of chunk records.
pub async fn load_corpus(path: &Path) -> Result<Vec<Chunk>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let records: Vec<CorpusRecord> = serde_json::from_str(&raw)?;

    let chunks: Vec<Chunk> = records
        .into_iter()
        .filter(|r| !r.text.trim().is_empty())
        .map(|r| Chunk {
            document_id: document_id_for(&r.id, &r.metadata),
            chunk_id: r.id,
            text: r.text,
            metadata: r.metadata,
        })
        .collect();

    info!(path = %path.display(), chunks = chunks.len(), "Corpus loaded");
    Ok(chunks)
}

/// Prefer the file stem; fall back to the id prefix before `-p{page}`.
fn document_id_for(chunk_id: &str, metadata: &ChunkMetadata) -> String {
    let name = if metadata.filename.is_empty() {
        metadata.source.as_str()
    } else {
        metadata.filename.as_str()
    };

    if let Some(stem) = Path::new(name).file_stem().and_then(|s| s.to_str()) {
        if !stem.is_empty() {
            return stem.to_string();
        }
    }

    match chunk_id.rfind("-p") {
        Some(i) if i > 0 => chunk_id[..i].to_string(),
        _ => chunk_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::HashingEmbedder;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            document_id: "doc".to_string(),
            text: text.to_string(),
            metadata: ChunkMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_cosine() {
        let index = InMemoryIndex::new();
        index.insert(chunk("x", "x"), vec![1.0, 0.0]).await.unwrap();
        index.insert(chunk("diag", "d"), vec![1.0, 1.0]).await.unwrap();
        index.insert(chunk("y", "y"), vec![0.0, 1.0]).await.unwrap();

        let hits = index.search(&[1.0, 0.2], 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "diag", "y"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order_and_repeat() {
        let index = InMemoryIndex::new();
        for id in ["first", "second", "third"] {
            index.insert(chunk(id, id), vec![0.5, 0.5]).await.unwrap();
        }

        let a = index.search(&[1.0, 1.0], 2).await.unwrap();
        let b = index.search(&[1.0, 1.0], 2).await.unwrap();
        let ids = |hits: &[IndexHit]| {
            hits.iter()
                .map(|h| h.chunk.chunk_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), vec!["first", "second"]);
        assert_eq!(ids(&a), ids(&b));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let index = InMemoryIndex::new();
        index.insert(chunk("a", "a"), vec![1.0, 0.0]).await.unwrap();
        assert!(index.insert(chunk("b", "b"), vec![1.0]).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let index = InMemoryIndex::new();
        assert!(index.search(&[1.0], 4).await.unwrap().is_empty());
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_from_chunks_with_hashing_embedder() {
        let embedder = HashingEmbedder::default();
        let index = InMemoryIndex::from_chunks(
            vec![
                chunk("menu-p1-c0", "How to pause a menu item in the merchant portal."),
                chunk("finance-p1-c0", "Payout schedules and settlement reconciliation."),
            ],
            &embedder,
        )
        .await
        .unwrap();

        let query = embedder.embed_sync("pause menu item");
        let hits = index.search(&query, 2).await.unwrap();
        assert_eq!(hits[0].chunk.chunk_id, "menu-p1-c0");
        assert_eq!(index.len().await, 2);
    }

    #[test]
    fn test_document_id_for() {
        let meta = ChunkMetadata {
            filename: "Onboarding_Guide.pdf".to_string(),
            ..Default::default()
        };
        assert_eq!(document_id_for("x", &meta), "Onboarding_Guide");
        assert_eq!(
            document_id_for("Menu_Ops-p3-c1", &ChunkMetadata::default()),
            "Menu_Ops"
        );
    }
}
