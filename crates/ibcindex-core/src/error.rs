//! Error types for the ibcindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
///
/// Protocol-level surprises (malformed payloads, missing predecessors,
/// light-client regressions) are *not* errors: they are recorded as
/// [`Anomaly`](crate::anomaly::Anomaly) rows and ingestion continues.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// An optimistic-concurrency check failed: someone else wrote the row.
    #[error("Concurrent update of {entity}: expected revision {expected:?}, found {found:?}")]
    Conflict {
        entity: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Storage(_))
    }

    /// Returns `true` if the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Shorthand used across the crate.
pub type Result<T, E = IndexerError> = std::result::Result<T, E>;
