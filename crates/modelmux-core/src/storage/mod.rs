//! Storage collaborator contracts.
//!
//! The router writes conversation turns to a [`HistoryStore`] and embedding
//! vectors to a [`VectorStore`]. Retention and retrieval policy belong to the
//! implementations; the file-backed and in-memory ones here are enough for a
//! single process.

mod history;
mod vector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::types::{Role, UsageMetadata};

pub use history::{HistoryEntry, JsonlHistoryStore};
pub use vector::{cosine_similarity, InMemoryVectorStore};

/// Append-only conversation log.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one turn. `usage` is set for generated (assistant) turns.
    async fn record(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        usage: Option<&UsageMetadata>,
    ) -> Result<(), StorageError>;
}

/// One hit from [`VectorStore::search`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    /// Similarity, higher is closer.
    pub score: f32,
    pub payload: serde_json::Value,
}

/// Vector backend keyed by collection and id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector stored under `id`.
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> Result<(), StorageError>;

    /// The `top_k` closest entries, best first.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>, StorageError>;
}
