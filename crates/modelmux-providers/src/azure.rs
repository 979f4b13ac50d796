//! Adapter for Azure OpenAI deployments.
//!
//! Azure addresses models by deployment name in the URL and authenticates
//! with an `api-key` header:
//! - `POST {base}/openai/deployments/{deployment}/chat/completions?api-version=…`
//! - `POST {base}/openai/deployments/{deployment}/embeddings?api-version=…`
//! - `GET  {base}/openai/models?api-version=…` (health probe)
//!
//! `model` is the chat deployment; `embedding_model` the embedding deployment.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use tokio::time::Instant;
use tracing::debug;

use modelmux_core::config::ProviderConfig;
use modelmux_core::error::{ConfigurationError, ProviderError};
use modelmux_core::types::{EmbeddingGeneration, GenerateOptions, Prompt, TextGeneration};

use crate::http::{AuthStyle, HttpTransport};
use crate::openai::{embedding_model, usage_from};
use crate::traits::ProviderAdapter;
use crate::wire::{ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse};

/// API version used when the provider config gives none.
pub const DEFAULT_API_VERSION: &str = "2024-02-01";

#[derive(Debug)]
pub struct AzureAdapter {
    config: Arc<ProviderConfig>,
    transport: HttpTransport,
    base_url: Url,
    api_version: String,
}

impl AzureAdapter {
    pub fn new(config: Arc<ProviderConfig>) -> Result<Self, ConfigurationError> {
        let transport = HttpTransport::new(&config, AuthStyle::ApiKeyHeader)?;
        let base_url = base_url(&config)?;
        let api_version = config
            .api_version
            .clone()
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());
        Ok(Self {
            config,
            transport,
            base_url,
            api_version,
        })
    }

    /// `{base}/openai/{segments...}?api-version=…`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("openai").extend(segments);
        }
        url.query_pairs_mut().append_pair("api-version", &self.api_version);
        url.into()
    }

    fn deployment_url(&self, deployment: &str, operation: &str) -> String {
        let mut segments = vec!["deployments", deployment];
        segments.extend(operation.split('/'));
        self.url(&segments)
    }
}

/// Endpoint without a trailing `/openai`, which is accepted either way.
fn base_url(config: &ProviderConfig) -> Result<Url, ConfigurationError> {
    let trimmed = config.endpoint.trim_end_matches('/');
    let base = trimmed.strip_suffix("/openai").unwrap_or(trimmed);
    let url = Url::parse(base).map_err(|e| {
        ConfigurationError::Invalid(format!("provider '{}': invalid endpoint '{}': {e}", config.id, config.endpoint))
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigurationError::Invalid(format!(
            "provider '{}': endpoint '{}' cannot carry a path",
            config.id, config.endpoint
        )));
    }
    Ok(url)
}

#[async_trait]
impl ProviderAdapter for AzureAdapter {
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
        let url = self.deployment_url(&request.model, "chat/completions");
        debug!(
            provider = %self.config.id,
            deployment = %request.model,
            messages = request.messages.len(),
            "Calling Azure chat completions"
        );

        let started = Instant::now();
        let response: ChatCompletionResponse = self.transport.post_json(&url, &request).await?;
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
        let deployment = embedding_model(&self.config, options)?;
        let request = EmbeddingRequest {
            model: deployment,
            input: text,
            dimensions: self.config.embedding_dimensions,
        };

        let started = Instant::now();
        let response: EmbeddingResponse = self
            .transport
            .post_json(&self.deployment_url(deployment, "embeddings"), &request)
            .await?;
        let (vector, usage) = response.into_vector()?;

        Ok(EmbeddingGeneration {
            vector,
            usage: usage_from(&self.config, deployment.to_string(), usage, started),
        })
    }

    async fn health_check(&self) -> bool {
        self.transport.probe(&self.url(&["models"])).await
    }
}
