//! Vector Store
//!
//! In-memory similarity index over embedded items. Built once at startup and
//! read-only afterwards, so it can be shared behind an `Arc` by any number of
//! concurrent readers.

use crate::embedding::Embedding;
use crate::error::{PipelineError, Result};

/// Search result from vector store
#[derive(Debug, Clone)]
pub struct SearchHit<'a, T> {
    pub item: &'a T,
    pub score: f32,
}

/// Linear-scan cosine index.
///
/// The dimension is fixed by the first inserted embedding.
#[derive(Debug, Clone)]
pub struct InMemoryVectorStore<T> {
    entries: Vec<(T, Embedding)>,
    dimension: Option<usize>,
}

impl<T> Default for InMemoryVectorStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryVectorStore<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            dimension: None,
        }
    }

    pub fn insert(&mut self, item: T, embedding: Embedding) -> Result<()> {
        if embedding.is_empty() {
            return Err(PipelineError::Embedding("Empty embedding vector".to_string()));
        }
        match self.dimension {
            Some(dimension) if dimension != embedding.len() => {
                return Err(PipelineError::Embedding(format!(
                    "Embedding dimension {} doesn't match store dimension {}",
                    embedding.len(),
                    dimension
                )));
            }
            Some(_) => {}
            None => self.dimension = Some(embedding.len()),
        }
        self.entries.push((item, embedding));
        Ok(())
    }

    /// Top-k entries by descending cosine similarity.
    ///
    /// Ties keep insertion order.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit<'_, T>>> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if let Some(dimension) = self.dimension {
            if query.len() != dimension {
                return Err(PipelineError::Embedding(format!(
                    "Query embedding dimension {} doesn't match store dimension {}",
                    query.len(),
                    dimension
                )));
            }
        }

        let mut hits: Vec<SearchHit<'_, T>> = self
            .entries
            .iter()
            .map(|(item, embedding)| SearchHit {
                item,
                score: cosine_similarity(query, embedding),
            })
            .collect();

        // sort_by is stable, which keeps ties in insertion order
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
