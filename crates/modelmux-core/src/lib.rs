//! Modelmux core: shared types, configuration, token counting, prompt
//! templates and storage contracts.
//!
//! This crate contains:
//! - **config**: JSON schema, loader, env overrides and validation
//! - **tokens**: model-aware token counter
//! - **template**: prompt template compiler and renderer
//! - **storage**: history and vector store contracts plus simple backends
//! - **error**: the error taxonomy shared by every crate

pub mod config;
pub mod error;
pub mod storage;
pub mod template;
pub mod tokens;
pub mod types;
pub mod utils;

pub use config::Config;
pub use error::{ConfigurationError, ProviderError, ProviderErrorKind, StorageError, TemplateError};
pub use template::{PromptLibrary, PromptTemplate};
pub use tokens::{MessageTokenCount, TokenCounter};
pub use types::{
    ChatMessage, EmbeddingGeneration, GenerateOptions, Prompt, Role, TextGeneration, UsageMetadata,
};
