//! Adapter for any OpenAI-compatible HTTP API (OpenAI, DeepSeek, vLLM,
//! Ollama, LM Studio, proxies…).
//!
//! Endpoints, relative to the configured base URL:
//! - `POST {base}/chat/completions`
//! - `POST {base}/embeddings`
//! - `GET  {base}/models` (health probe)

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use modelmux_core::config::ProviderConfig;
use modelmux_core::error::{ConfigurationError, ProviderError};
use modelmux_core::types::{
    EmbeddingGeneration, GenerateOptions, Prompt, TextGeneration, UsageMetadata,
};

use crate::http::{AuthStyle, HttpTransport};
use crate::traits::ProviderAdapter;
use crate::wire::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse, WireUsage,
};

/// Build usage metadata from the vendor's counts (zeros when absent).
pub(crate) fn usage_from(
    config: &ProviderConfig,
    model: String,
    usage: Option<WireUsage>,
    started: Instant,
) -> UsageMetadata {
    let usage = usage.unwrap_or_default();
    UsageMetadata {
        provider_id: config.id.clone(),
        provider_name: config.display_name().to_string(),
        model,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        },
        latency: started.elapsed(),
        ..Default::default()
    }
}

/// Embedding model for a call: explicit override, else the configured one.
pub(crate) fn embedding_model<'a>(
    config: &'a ProviderConfig,
    options: &'a GenerateOptions,
) -> Result<&'a str, ProviderError> {
    options
        .model_override
        .as_deref()
        .or(config.embedding_model.as_deref())
        .ok_or_else(|| {
            ProviderError::invalid_request(format!(
                "provider '{}' has no embedding model configured",
                config.id
            ))
        })
}

// ─────────────────────────────────────────────
// OpenAiCompatibleAdapter
// ─────────────────────────────────────────────

/// Talks to `/chat/completions` and `/embeddings` with Bearer auth.
#[derive(Debug)]
pub struct OpenAiCompatibleAdapter {
    config: Arc<ProviderConfig>,
    transport: HttpTransport,
}

impl OpenAiCompatibleAdapter {
    pub fn new(config: Arc<ProviderConfig>) -> Result<Self, ConfigurationError> {
        let transport = HttpTransport::new(&config, AuthStyle::Bearer)?;
        Ok(Self { config, transport })
    }

    fn url(&self, endpoint: &str) -> String {
        let base = self.config.endpoint.trim_end_matches('/');
        format!("{}/{}", base, endpoint)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn display_name(&self) -> &str {
        self.config.display_name()
    }

    async fn generate_text(
        &self,
        prompt: &Prompt,
        options: &GenerateOptions,
    ) -> Result<TextGeneration, ProviderError> {
        let request = ChatCompletionRequest::build(&self.config, prompt, options);
        debug!(
            provider = %self.config.id,
            model = %request.model,
            messages = request.messages.len(),
            "Calling chat completions"
        );

        let started = Instant::now();
        let response: ChatCompletionResponse = self
            .transport
            .post_json(&self.url("chat/completions"), &request)
            .await?;
        let (text, model, usage) = response.into_text()?;

        Ok(TextGeneration {
            text,
            usage: usage_from(&self.config, model.unwrap_or(request.model), usage, started),
        })
    }

    async fn generate_embedding(
        &self,
        text: &str,
        options: &GenerateOptions,
    ) -> Result<EmbeddingGeneration, ProviderError> {
        let model = embedding_model(&self.config, options)?;
        let request = EmbeddingRequest {
            model,
            input: text,
            dimensions: self.config.embedding_dimensions,
        };

        let started = Instant::now();
        let response: EmbeddingResponse = self
            .transport
            .post_json(&self.url("embeddings"), &request)
            .await?;
        let (vector, usage) = response.into_vector()?;

        Ok(EmbeddingGeneration {
            vector,
            usage: usage_from(&self.config, model.to_string(), usage, started),
        })
    }

    async fn health_check(&self) -> bool {
        self.transport.probe(&self.url("models")).await
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
