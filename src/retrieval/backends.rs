//! Embedding and vector search boundaries.
//!
//! Both traits are blocking: vendor SDKs for these are synchronous, and the
//! retrieval engine runs them on the blocking pool.

use std::sync::{RwLock, RwLockReadGuard};

use super::types::Document;
use crate::error::{AgentError, Result};

/// Turns text into a dense vector.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Nearest-neighbour search over embedded documents.
pub trait VectorStore: Send + Sync {
    /// Up to `top_k` documents, best first, with `score` filled in.
    fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Document>>;
}

/// Brute-force cosine similarity store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<(Document, Vec<f32>)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document, embedding: Vec<f32>) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((document, embedding));
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<(Document, Vec<f32>)>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl VectorStore for InMemoryVectorStore {
    fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Document>> {
        let entries = self.read();
        let mut scored = Vec::with_capacity(entries.len());
        for (doc, vector) in entries.iter() {
            if vector.len() != embedding.len() {
                return Err(AgentError::Retrieval(format!(
                    "dimension mismatch: query {} vs stored {}",
                    embedding.len(),
                    vector.len()
                )));
            }
            let mut doc = doc.clone();
            doc.score = cosine(embedding, vector);
            scored.push(doc);
        }
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
