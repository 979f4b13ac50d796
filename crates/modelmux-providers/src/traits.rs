//! Provider adapter trait: the capability contract the router consumes.
//!
//! Every vendor protocol (OpenAI-compatible, Azure, …) implements this trait.
//! The router never sees vendor details, only [`ProviderError`] kinds and
//! usage metadata.

use async_trait::async_trait;
use modelmux_core::error::ProviderError;
use modelmux_core::types::{EmbeddingGeneration, GenerateOptions, Prompt, TextGeneration};

/// A configured backend able to serve generation and embedding requests.
///
/// Implementations must bound every call by the provider's configured
/// timeout, cancel the in-flight request when it elapses, and surface
/// `ProviderErrorKind::Timeout`.
///
/// Usage returned with a result carries the vendor-reported token counts.
/// When the vendor reports none, `total_tokens` is left at 0 and the router
/// estimates the counts.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider id from configuration.
    fn id(&self) -> &str;

    /// Display name for logging and usage metadata.
    fn display_name(&self) -> &str;

    /// Generate text from a prompt or conversation.
    async fn generate_text(
        &self,
        prompt: &Prompt,
        options: &GenerateOptions,
    ) -> Result<TextGeneration, ProviderError>;

    /// Embed a single text.
    async fn generate_embedding(
        &self,
        text: &str,
        options: &GenerateOptions,
    ) -> Result<EmbeddingGeneration, ProviderError>;

    /// Cheap reachability probe. Never used on the request path.
    async fn health_check(&self) -> bool;
}
