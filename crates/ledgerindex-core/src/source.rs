//! Chain source boundary.
//!
//! A [`ChainSource`] delivers already-normalized [`TransferLog`]s. Decoding
//! raw logs is the adapter's job (see `ledgerindex-evm`).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;
use crate::types::{BlockSummary, LogFilter, TransferLog};

/// An item on a subscription's log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A matching transfer log.
    Log(TransferLog),
    /// Every matching log up to and including this block has been delivered.
    Scanned(u64),
}

/// A live log subscription: a log stream plus a side channel for errors.
///
/// The subscription is over when `events` yields `None`. Errors on `errors`
/// are informational; the stream may keep going after them.
pub struct LogSubscription {
    pub events: mpsc::Receiver<SourceEvent>,
    pub errors: mpsc::Receiver<IndexerError>,
}

/// Access to the chain being indexed.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Start delivering logs matching `filter` until `cancel` fires.
    async fn subscribe_logs(
        &self,
        filter: LogFilter,
        cancel: CancellationToken,
    ) -> Result<LogSubscription, IndexerError>;

    /// All matching logs in `[from, to]`.
    async fn filter_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<TransferLog>, IndexerError>;

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError>;

    async fn block_by_hash(&self, hash: &str) -> Result<Option<BlockSummary>, IndexerError>;

    /// Latest block height.
    async fn current_block_number(&self) -> Result<u64, IndexerError>;

    /// Release connections. Called last during shutdown.
    async fn close(&self) {}
}
