//! Embedding index: the router's embedding path feeding a [`VectorStore`].

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use modelmux_core::error::StorageError;
use modelmux_core::storage::{SearchHit, VectorStore};
use modelmux_core::types::UsageMetadata;

use crate::error::RouterError;
use crate::manager::LlmManager;
use crate::options::RequestOptions;

/// Task used for embedding requests unless overridden.
pub const EMBEDDING_TASK: &str = "embeddings";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Embeds documents and queries through an [`LlmManager`] and stores them in
/// one collection of a [`VectorStore`].
pub struct EmbeddingIndex {
    manager: Arc<LlmManager>,
    store: Arc<dyn VectorStore>,
    collection: String,
    task: String,
    options: RequestOptions,
}

impl EmbeddingIndex {
    pub fn new(manager: Arc<LlmManager>, store: Arc<dyn VectorStore>, collection: impl Into<String>) -> Self {
        Self {
            manager,
            store,
            collection: collection.into(),
            task: EMBEDDING_TASK.to_string(),
            options: RequestOptions::default(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    /// Options applied to every embedding call (deadline, model override).
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Embed `text` and store it under `id` with `payload`.
    pub async fn index(
        &self,
        id: &str,
        text: &str,
        payload: serde_json::Value,
    ) -> Result<UsageMetadata, IndexError> {
        let embedding = self
            .manager
            .generate_embedding(text, &self.task, &self.options)
            .await?;
        self.store
            .upsert(&self.collection, id, embedding.vector, payload)
            .await?;
        debug!(collection = %self.collection, id, provider = %embedding.usage.provider_id, "Indexed document");
        Ok(embedding.usage)
    }

    /// The `top_k` stored entries closest to `text`.
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>, IndexError> {
        let embedding = self
            .manager
            .generate_embedding(text, &self.task, &self.options)
            .await?;
        Ok(self
            .store
            .search(&self.collection, &embedding.vector, top_k)
            .await?)
    }
}
