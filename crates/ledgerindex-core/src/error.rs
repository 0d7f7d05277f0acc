//! Error types for the ledgerindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Chain RPC timeout, disconnect, or malformed response.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// A chain payload that cannot be decoded (bad hex quantity, out-of-range index).
    #[error("Decode error: {0}")]
    Decode(String),

    /// Durable store read/write failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cache engine failure. Never surfaced to readers; the read path degrades to the store.
    #[error("Cache error: {0}")]
    Cache(String),

    /// A rollback could not be completed. Forward progress must halt.
    #[error("Reorg rollback failed at block {block_number}: {reason}")]
    ReorgInconsistency { block_number: u64, reason: String },

    /// Invalid address, block range, or configuration value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A replay sub-range failed; the checkpoint covers everything before `from`.
    #[error("Replay failed for blocks [{from}, {to}]: {reason}")]
    ReplayFailed { from: u64, to: u64, reason: String },

    /// One or more per-contract historical tasks failed.
    #[error("Historical processing failed for {} task(s): {}", failures.len(), failures.join("; "))]
    Historical { failures: Vec<String> },

    /// Ingestion is halted after a failed rollback.
    #[error("Indexer halted: {reason}")]
    Halted { reason: String },

    /// The batch writer no longer accepts events.
    #[error("Batch writer is shutting down")]
    ShuttingDown,

    /// The operation observed the shutdown signal.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Storage(_) | Self::Cache(_))
    }

    /// Returns `true` if the error must stop forward processing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReorgInconsistency { .. } | Self::Halted { .. })
    }

    /// Returns `true` if the error came from cooperative shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Cancelled)
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Other(format!("serialization: {e}"))
    }
}

impl From<prometheus::Error> for IndexerError {
    fn from(e: prometheus::Error) -> Self {
        Self::Other(format!("metrics: {e}"))
    }
}
