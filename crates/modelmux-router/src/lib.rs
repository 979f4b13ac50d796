//! Provider registry and router for Modelmux.
//!
//! # Architecture
//!
//! - [`manager::LlmManager`]: resolves a task to candidate providers and runs
//!   the retry / fail-over / cooldown sequence
//! - [`health`]: per-provider runtime state and status snapshots
//! - [`routing::TaskRoutingTable`]: task and model rules → ordered provider ids
//! - `balance`: spreads requests over the candidate pool
//! - [`index::EmbeddingIndex`]: embeddings into a vector store

mod balance;
pub mod error;
pub mod health;
pub mod index;
pub mod manager;
mod operation;
pub mod options;
pub mod routing;

pub use error::{CandidateFailure, RouterError};
pub use health::{HealthState, ProbeReport, ProviderStatus};
pub use index::{EmbeddingIndex, IndexError};
pub use manager::LlmManager;
pub use options::RequestOptions;
pub use routing::TaskRoutingTable;
pub use tokio_util::sync::CancellationToken;
