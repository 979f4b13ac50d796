//! Core request/response types shared by adapters and the router.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::duration_ms;

// ─────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────

/// Speaker of a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role-tagged message in a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Input to a text generation: a bare prompt or a full conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prompt {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl Prompt {
    /// The prompt as a message list (a bare prompt becomes one user message).
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            Prompt::Text(text) => vec![ChatMessage::user(text.clone())],
            Prompt::Messages(messages) => messages.clone(),
        }
    }

    /// The text of the last user turn, used when recording history.
    pub fn last_user_text(&self) -> Option<&str> {
        match self {
            Prompt::Text(text) => Some(text),
            Prompt::Messages(messages) => messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str()),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<Vec<ChatMessage>> for Prompt {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Prompt::Messages(messages)
    }
}

// ─────────────────────────────────────────────
// Options bag passed to adapters
// ─────────────────────────────────────────────

/// Per-call generation options understood by every adapter.
///
/// Unset fields fall back to the provider's configured defaults.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerateOptions {
    /// Caps output length.
    pub max_tokens: Option<u32>,
    /// Sampling randomness.
    pub temperature: Option<f32>,
    /// Bypasses the provider's configured model for this call.
    pub model_override: Option<String>,
    /// Stop sequences.
    pub stop: Option<Vec<String>>,
}

// ─────────────────────────────────────────────
// Usage accounting
// ─────────────────────────────────────────────

/// Token and latency accounting for one completed call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub provider_id: String,
    pub provider_name: String,
    pub model: String,
    #[serde(default)]
    pub task: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(with = "duration_ms", rename = "latency_ms")]
    pub latency: Duration,
    /// Attempts made across all candidates for the logical request.
    #[serde(default)]
    pub attempts: u32,
    /// True when the vendor reported no usage and the counts were estimated.
    #[serde(default)]
    pub estimated: bool,
}

/// Result of a successful `generate_text` call.
#[derive(Clone, Debug, PartialEq)]
pub struct TextGeneration {
    pub text: String,
    pub usage: UsageMetadata,
}

/// Result of a successful `generate_embedding` call.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingGeneration {
    pub vector: Vec<f32>,
    pub usage: UsageMetadata,
}
