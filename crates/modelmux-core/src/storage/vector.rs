//! In-memory vector store with brute-force cosine search.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SearchHit, VectorStore};
use crate::error::StorageError;

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[derive(Default)]
struct Collection {
    /// Fixed by the first vector written.
    dimensions: usize,
    entries: HashMap<String, (Vec<f32>, serde_json::Value)>,
}

/// Process-local [`VectorStore`]. Each collection keeps one dimensionality.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vectors in `collection`.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, |c| c.entries.len())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> Result<(), StorageError> {
        if vector.is_empty() {
            return Err(StorageError::Backend("cannot store an empty vector".into()));
        }
        let mut collections = self.collections.write().await;
        let entry = collections.entry(collection.to_string()).or_default();
        if entry.entries.is_empty() {
            entry.dimensions = vector.len();
        } else if entry.dimensions != vector.len() {
            return Err(StorageError::DimensionMismatch {
                collection: collection.to_string(),
                expected: entry.dimensions,
                actual: vector.len(),
            });
        }
        entry.entries.insert(id.to_string(), (vector, payload));
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>, StorageError> {
        let collections = self.collections.read().await;
        let Some(entry) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        if !entry.entries.is_empty() && entry.dimensions != vector.len() {
            return Err(StorageError::DimensionMismatch {
                collection: collection.to_string(),
                expected: entry.dimensions,
                actual: vector.len(),
            });
        }

        let mut hits: Vec<SearchHit> = entry
            .entries
            .iter()
            .map(|(id, (stored, payload))| SearchHit {
                id: id.clone(),
                score: cosine_similarity(vector, stored),
                payload: payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }
}
