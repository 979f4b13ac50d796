//! Build adapters from configuration.
//!
//! Provider kinds are a closed enum; adding a vendor means adding a variant
//! and an arm here, never touching the router.

use std::sync::Arc;

use tracing::debug;

use modelmux_core::config::{ProviderConfig, ProviderKind};
use modelmux_core::error::ConfigurationError;

use crate::azure::AzureAdapter;
use crate::openai::OpenAiCompatibleAdapter;
use crate::traits::ProviderAdapter;

/// Create the adapter for `config.kind`, validating the endpoint URL.
pub fn build_adapter(config: Arc<ProviderConfig>) -> Result<Arc<dyn ProviderAdapter>, ConfigurationError> {
    let url = reqwest::Url::parse(&config.endpoint).map_err(|e| {
        ConfigurationError::Invalid(format!(
            "provider '{}' has an invalid endpoint '{}': {}",
            config.id, config.endpoint, e
        ))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigurationError::Invalid(format!(
            "provider '{}' endpoint must be http(s), got '{}'",
            config.id,
            url.scheme()
        )));
    }

    debug!(
        provider = %config.id,
        kind = %config.kind,
        endpoint = %config.endpoint,
        model = %config.model,
        "Creating provider adapter"
    );

    let adapter: Arc<dyn ProviderAdapter> = match config.kind {
        ProviderKind::OpenAiCompatible => Arc::new(OpenAiCompatibleAdapter::new(config)?),
        ProviderKind::Azure => Arc::new(AzureAdapter::new(config)?),
    };
    Ok(adapter)
}
