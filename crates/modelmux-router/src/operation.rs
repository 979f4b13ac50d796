//! The two request shapes the router dispatches.
//!
//! Everything kind-specific about a call lives here: checks before the first
//! attempt, the adapter call itself, validation of what came back, and usage
//! estimation when the vendor did not report any.

use async_trait::async_trait;

use modelmux_core::config::ProviderConfig;
use modelmux_core::error::ProviderError;
use modelmux_core::tokens::TokenCounter;
use modelmux_core::types::{
    EmbeddingGeneration, GenerateOptions, Prompt, TextGeneration, UsageMetadata,
};
use modelmux_providers::ProviderAdapter;

#[async_trait]
pub(crate) trait Operation: Sync {
    type Output: Send;

    /// Reject a candidate before any network call. Failures here are the
    /// request's fault and do not count against the provider.
    fn preflight(
        &self,
        config: &ProviderConfig,
        tokens: &TokenCounter,
        options: &GenerateOptions,
    ) -> Result<(), ProviderError>;

    async fn invoke(
        &self,
        adapter: &dyn ProviderAdapter,
        options: &GenerateOptions,
    ) -> Result<Self::Output, ProviderError>;

    /// Check a successful response before accepting it.
    fn validate(&self, _config: &ProviderConfig, _output: &Self::Output) -> Result<(), ProviderError> {
        Ok(())
    }

    fn usage_mut(output: &mut Self::Output) -> &mut UsageMetadata;

    /// Fill in token counts for a vendor that returned none.
    fn estimate_usage(&self, tokens: &TokenCounter, output: &mut Self::Output);
}

/// Model to count tokens against: the given one if the counter knows it,
/// otherwise the counter's default.
pub(crate) fn counting_model<'a>(tokens: &'a TokenCounter, model: &'a str) -> &'a str {
    if tokens.knows(model) {
        model
    } else {
        tokens.default_model()
    }
}

fn requested_model<'a>(config: &'a ProviderConfig, options: &'a GenerateOptions) -> &'a str {
    options.model_override.as_deref().unwrap_or(&config.model)
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

// ─────────────────────────────────────────────
// Text
// ─────────────────────────────────────────────

pub(crate) struct TextRequest<'a> {
    pub prompt: &'a Prompt,
}

#[async_trait]
impl Operation for TextRequest<'_> {
    type Output = TextGeneration;

    fn preflight(
        &self,
        config: &ProviderConfig,
        tokens: &TokenCounter,
        options: &GenerateOptions,
    ) -> Result<(), ProviderError> {
        let model = requested_model(config, options);
        let Some(window) = config.context_window.or_else(|| tokens.context_window(model)) else {
            return Ok(());
        };

        let counted = counting_model(tokens, model);
        let prompt_tokens = match tokens.count_message_tokens(&self.prompt.to_messages(), counted) {
            Ok(count) => to_u32(count.total),
            Err(e) => {
                tracing::debug!(provider = %config.id, error = %e, "Skipping token budget check");
                return Ok(());
            }
        };
        let reply_tokens = options.max_tokens.or(config.max_tokens).unwrap_or(0);

        if prompt_tokens.saturating_add(reply_tokens) > window {
            return Err(ProviderError::invalid_request(format!(
                "prompt needs {prompt_tokens} tokens plus {reply_tokens} for the reply, \
                 over the {window} token context window of {model}"
            )));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        adapter: &dyn ProviderAdapter,
        options: &GenerateOptions,
    ) -> Result<TextGeneration, ProviderError> {
        adapter.generate_text(self.prompt, options).await
    }

    fn usage_mut(output: &mut TextGeneration) -> &mut UsageMetadata {
        &mut output.usage
    }

    fn estimate_usage(&self, tokens: &TokenCounter, output: &mut TextGeneration) {
        let model = counting_model(tokens, &output.usage.model).to_string();
        let prompt = tokens
            .count_message_tokens(&self.prompt.to_messages(), &model)
            .map(|c| c.total)
            .unwrap_or(0);
        let completion = tokens.count_tokens(&output.text, &model).unwrap_or(0);

        let usage = &mut output.usage;
        usage.prompt_tokens = to_u32(prompt);
        usage.completion_tokens = to_u32(completion);
        usage.total_tokens = usage.prompt_tokens.saturating_add(usage.completion_tokens);
        usage.estimated = true;
    }
}

// ─────────────────────────────────────────────
// Embedding
// ─────────────────────────────────────────────

pub(crate) struct EmbeddingRequest<'a> {
    pub text: &'a str,
}

#[async_trait]
impl Operation for EmbeddingRequest<'_> {
    type Output = EmbeddingGeneration;

    fn preflight(
        &self,
        config: &ProviderConfig,
        _tokens: &TokenCounter,
        options: &GenerateOptions,
    ) -> Result<(), ProviderError> {
        if config.embedding_model.is_none() && options.model_override.is_none() {
            return Err(ProviderError::invalid_request(format!(
                "provider '{}' has no embedding model",
                config.id
            )));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        adapter: &dyn ProviderAdapter,
        options: &GenerateOptions,
    ) -> Result<EmbeddingGeneration, ProviderError> {
        adapter.generate_embedding(self.text, options).await
    }

    fn validate(&self, config: &ProviderConfig, output: &EmbeddingGeneration) -> Result<(), ProviderError> {
        match config.embedding_dimensions {
            Some(expected) if output.vector.len() != expected => Err(ProviderError::invalid_request(format!(
                "embedding has {} dimensions, provider '{}' is configured for {}",
                output.vector.len(),
                config.id,
                expected
            ))),
            _ if output.vector.is_empty() => Err(ProviderError::unavailable("empty embedding vector")),
            _ => Ok(()),
        }
    }

    fn usage_mut(output: &mut EmbeddingGeneration) -> &mut UsageMetadata {
        &mut output.usage
    }

    fn estimate_usage(&self, tokens: &TokenCounter, output: &mut EmbeddingGeneration) {
        let model = counting_model(tokens, &output.usage.model).to_string();
        let usage = &mut output.usage;
        usage.prompt_tokens = to_u32(tokens.count_tokens(self.text, &model).unwrap_or(0));
        usage.completion_tokens = 0;
        usage.total_tokens = usage.prompt_tokens;
        usage.estimated = true;
    }
}
