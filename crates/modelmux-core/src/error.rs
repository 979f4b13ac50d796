//! Error taxonomy shared by every Modelmux crate.
//!
//! - [`ConfigurationError`]: bad or missing configuration, fatal at startup.
//! - [`TemplateError`]: a prompt template failed to compile or render.
//! - [`ProviderError`]: one failed attempt against one provider.
//! - [`StorageError`]: a history/vector store collaborator failed.
//!
//! Router-level outcomes (`NoProviderAvailable`, `AllProvidersFailed`) live in
//! `modelmux-router`, since only the router can produce them.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────

/// Invalid or missing configuration. Never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The token counter has no tokenization rule for this model.
    #[error("unknown model '{model}': no tokenization rule registered")]
    UnknownModel { model: String },

    /// An unknown tokenizer encoding name was used when registering a model.
    #[error("unknown encoding '{encoding}'")]
    UnknownEncoding { encoding: String },

    /// A provider id is referenced but not defined.
    #[error("unknown provider '{id}' referenced by {referenced_by}")]
    UnknownProvider { id: String, referenced_by: String },

    /// Two providers share the same id.
    #[error("duplicate provider id '{id}'")]
    DuplicateProvider { id: String },

    /// Any other semantic problem with the configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A tokenizer encoding could not be constructed.
    #[error("tokenizer '{encoding}' unavailable: {message}")]
    Tokenizer { encoding: String, message: String },
}

// ─────────────────────────────────────────────
// Templates
// ─────────────────────────────────────────────

/// A prompt template failed to compile or render. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// Compile-time syntax error with its 1-based source position.
    #[error("template syntax error at line {line}, column {column}: {message}")]
    Syntax {
        message: String,
        line: usize,
        column: usize,
    },

    /// A `{name}` substitution had no value and no fallback.
    #[error("missing template variable '{name}'")]
    MissingVariable { name: String },

    /// A `{%for%}` loop was given something other than an array.
    #[error("template variable '{name}' is not iterable")]
    NotIterable { name: String },

    /// A named template was not found in a [`crate::template::PromptLibrary`].
    #[error("unknown template '{name}'")]
    UnknownTemplate { name: String },
}

// ─────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────

/// Classification of a single failed provider attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    AuthFailed,
    Timeout,
    InvalidRequest,
    Unavailable,
}

impl ProviderErrorKind {
    /// Transient failures are retried against the same provider; the rest
    /// advance straight to the next candidate.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited | ProviderErrorKind::Timeout | ProviderErrorKind::Unavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::AuthFailed => "auth_failed",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::InvalidRequest => "invalid_request",
            ProviderErrorKind::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt against one provider.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::AuthFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// ─────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────

/// A storage collaborator (history or vector store) failed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vector dimension mismatch in collection '{collection}': expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}
