//! JSONL conversation history.
//!
//! File format: `{history_dir}/{safe_conversation_id}.jsonl`
//! - Line 1: `{"_type":"metadata","conversation_id":"...","created_at":"..."}`
//! - Line 2+: `{"role":"user","content":"hello","timestamp":"...","usage":{...}}`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::HistoryStore;
use crate::error::StorageError;
use crate::types::{Role, UsageMetadata};
use crate::utils;

// ─────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────

/// Metadata header written as the first line of each history file.
#[derive(Debug, Serialize, Deserialize)]
struct HistoryMetadata {
    #[serde(rename = "_type")]
    record_type: String,
    conversation_id: String,
    created_at: DateTime<Utc>,
}

/// One recorded turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,
}

// ─────────────────────────────────────────────
// JsonlHistoryStore
// ─────────────────────────────────────────────

/// Appends turns to one JSONL file per conversation.
///
/// Writes are serialized through an async mutex so concurrent turns never
/// interleave within a line.
pub struct JsonlHistoryStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHistoryStore {
    /// Create a store rooted at `dir` (default `~/.modelmux/history/`).
    ///
    /// The directory is created if it doesn't exist.
    pub fn new(dir: Option<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.unwrap_or_else(utils::get_history_path);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", utils::safe_filename(conversation_id)))
    }

    /// Read back every turn of a conversation, oldest first.
    ///
    /// Unknown conversations yield an empty list; corrupt lines are skipped.
    pub async fn load(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, StorageError> {
        let path = self.conversation_path(conversation_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if i == 0 || line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping corrupt history line {} in {}: {}", i + 1, path.display(), e),
            }
        }
        Ok(entries)
    }

    /// Conversation file stems present on disk, sorted.
    pub async fn conversations(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn record(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        usage: Option<&UsageMetadata>,
    ) -> Result<(), StorageError> {
        let entry = HistoryEntry {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            usage: usage.cloned(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let path = self.conversation_path(conversation_id);
        let _guard = self.write_lock.lock().await;

        let is_new = !tokio::fs::try_exists(&path).await.unwrap_or(false);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if is_new {
            let meta = HistoryMetadata {
                record_type: "metadata".into(),
                conversation_id: conversation_id.to_string(),
                created_at: entry.timestamp,
            };
            let mut header = serde_json::to_string(&meta)?;
            header.push('\n');
            file.write_all(header.as_bytes()).await?;
            debug!("Started history file {}", path.display());
        }

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
