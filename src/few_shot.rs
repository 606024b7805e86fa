//! Few-shot Example Store and Example Selector
//!
//! A fixed set of (question, query) pairs is embedded once at startup. For
//! every incoming question the `k` most similar pairs are shown to the
//! language model as worked examples.
//!
//! Ties between equally similar examples resolve in insertion order of the
//! index. That order depends on the embedding backend producing identical
//! scores, so selection among near-identical examples is not guaranteed to
//! be stable across embedding model versions.

use crate::embedding::Embedder;
use crate::error::{PipelineError, Result};
use crate::vector_store::InMemoryVectorStore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const BUNDLED_EXAMPLES: &str = include_str!("../data/few_shot_examples.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    /// Natural-language question
    pub input: String,
    /// Reference query answering it
    pub query: String,
}

/// Examples shipped with the crate.
pub fn default_examples() -> Result<Vec<FewShotExample>> {
    parse_examples(BUNDLED_EXAMPLES)
}

pub fn load_examples(path: &Path) -> Result<Vec<FewShotExample>> {
    let raw = std::fs::read_to_string(path)?;
    let examples = parse_examples(&raw)?;
    info!("Loaded {} few-shot examples from {}", examples.len(), path.display());
    Ok(examples)
}

fn parse_examples(raw: &str) -> Result<Vec<FewShotExample>> {
    let examples: Vec<FewShotExample> = serde_json::from_str(raw)?;
    if let Some(blank) = examples
        .iter()
        .find(|e| e.input.trim().is_empty() || e.query.trim().is_empty())
    {
        return Err(PipelineError::Config(format!(
            "few-shot example has an empty field: {:?}",
            blank
        )));
    }
    Ok(examples)
}

/// Similarity index over the `input` field of every example.
pub struct ExampleStore {
    index: InMemoryVectorStore<FewShotExample>,
}

impl ExampleStore {
    pub async fn build(examples: Vec<FewShotExample>, embedder: &dyn Embedder) -> Result<Self> {
        let inputs: Vec<String> = examples.iter().map(|e| e.input.clone()).collect();
        let embeddings = embedder.embed_batch(&inputs).await?;
        if embeddings.len() != examples.len() {
            return Err(PipelineError::Embedding(format!(
                "embedded {} of {} examples",
                embeddings.len(),
                examples.len()
            )));
        }

        let mut index = InMemoryVectorStore::new();
        for (example, embedding) in examples.into_iter().zip(embeddings) {
            index.insert(example, embedding)?;
        }
        info!("Built example index with {} entries", index.len());
        Ok(Self { index })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

pub struct ExampleSelector {
    store: Arc<ExampleStore>,
    embedder: Arc<dyn Embedder>,
    k: usize,
}

impl ExampleSelector {
    pub fn new(store: Arc<ExampleStore>, embedder: Arc<dyn Embedder>, k: usize) -> Self {
        Self { store, embedder, k }
    }

    /// Up to `k` examples most similar to `question`, most similar first.
    pub async fn select(&self, question: &str) -> Result<Vec<FewShotExample>> {
        if self.store.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(question).await?;
        let hits = self.store.index.search(&query, self.k)?;
        debug!(
            "Selected examples: {:?}",
            hits.iter().map(|h| (&h.item.input, h.score)).collect::<Vec<_>>()
        );
        Ok(hits.into_iter().map(|hit| hit.item.clone()).collect())
    }
}
