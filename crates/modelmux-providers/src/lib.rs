//! LLM provider adapters for Modelmux.
//!
//! # Architecture
//!
//! - [`traits::ProviderAdapter`]: capability contract every vendor implements
//! - [`openai::OpenAiCompatibleAdapter`]: any OpenAI-compatible HTTP API
//! - [`azure::AzureAdapter`]: Azure OpenAI deployments
//! - [`factory::build_adapter`]: adapter for a `ProviderConfig`

pub mod azure;
pub mod factory;
mod http;
pub mod openai;
pub mod traits;
mod wire;

pub use azure::AzureAdapter;
pub use factory::build_adapter;
pub use openai::OpenAiCompatibleAdapter;
pub use traits::ProviderAdapter;
