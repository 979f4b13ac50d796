//! OpenAI-style wire types shared by the OpenAI-compatible and Azure adapters.

use serde::{Deserialize, Serialize};

use modelmux_core::config::ProviderConfig;
use modelmux_core::error::ProviderError;
use modelmux_core::types::{ChatMessage, GenerateOptions, Prompt};

// ─────────────────────────────────────────────
// Chat completions
// ─────────────────────────────────────────────

/// `POST /chat/completions` body.
#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl ChatCompletionRequest {
    /// Merge call options over the provider defaults.
    pub fn build(config: &ProviderConfig, prompt: &Prompt, options: &GenerateOptions) -> Self {
        Self {
            model: options
                .model_override
                .clone()
                .unwrap_or_else(|| config.model.clone()),
            messages: prompt.to_messages(),
            max_tokens: options.max_tokens.or(config.max_tokens),
            temperature: options.temperature.or(config.temperature),
            stop: options.stop.clone().filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    /// Text of the first choice. A response without choices is a vendor fault.
    pub fn into_text(self) -> Result<(String, Option<String>, Option<WireUsage>), ProviderError> {
        let model = self.model;
        let usage = self.usage;
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::unavailable("response contained no choices"))?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(ProviderError::invalid_request("response blocked by content filter"));
        }
        Ok((choice.message.content.unwrap_or_default(), model, usage))
    }
}

// ─────────────────────────────────────────────
// Embeddings
// ─────────────────────────────────────────────

/// `POST /embeddings` body.
#[derive(Debug, Serialize)]
pub(crate) struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingResponse {
    #[serde(default)]
    pub data: Vec<EmbeddingData>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingData {
    pub embedding: Vec<f32>,
}

impl EmbeddingResponse {
    pub fn into_vector(self) -> Result<(Vec<f32>, Option<WireUsage>), ProviderError> {
        let usage = self.usage;
        let vector = self
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProviderError::unavailable("response contained no embedding"))?;
        Ok((vector, usage))
    }
}

// ─────────────────────────────────────────────
// Usage + errors
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// `{"error": {"message": "...", "code": "..."}}`
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}
