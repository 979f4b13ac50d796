//! Terminal outcomes of a routed request.
//!
//! Individual provider attempts never cross the router boundary; callers see
//! either a result or one [`RouterError`].

use std::fmt;

use modelmux_core::error::{ConfigurationError, ProviderError};
use thiserror::Error;

/// Why one candidate was given up on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateFailure {
    pub provider_id: String,
    /// Attempts made against this candidate (0 when skipped before sending).
    pub attempts: u32,
    /// The last error seen for this candidate.
    pub error: ProviderError,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.provider_id, self.attempts, self.error
        )
    }
}

fn join_failures(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum RouterError {
    /// No eligible candidate for the task: nothing routed, all disabled, or
    /// all cooling down. No network call was made.
    #[error("no provider available for task '{task}': {reason}")]
    NoProviderAvailable { task: String, reason: String },

    /// Every candidate was tried and failed, in order.
    #[error("all providers failed for task '{task}': {}", join_failures(.failures))]
    AllProvidersFailed {
        task: String,
        failures: Vec<CandidateFailure>,
    },

    /// The caller's overall deadline elapsed before a result.
    #[error("deadline exceeded for task '{task}' after {attempts} attempt(s)")]
    DeadlineExceeded { task: String, attempts: u32 },

    /// The caller cancelled the request.
    #[error("request for task '{task}' was cancelled")]
    Cancelled { task: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl RouterError {
    /// Per-candidate failures, empty unless every provider failed.
    pub fn failures(&self) -> &[CandidateFailure] {
        match self {
            RouterError::AllProvidersFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}
