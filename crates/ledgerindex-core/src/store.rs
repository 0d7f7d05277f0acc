//! Durable store boundary.
//!
//! Backends implement the four narrow traits below plus [`IndexStore`], which
//! bundles them and provides the rollback used by the reorg monitor.
//! Uniqueness is enforced by the store (insert-or-ignore on `event_key` and on
//! the marker key), so callers never need in-process locking around writes.

use async_trait::async_trait;

use crate::checkpoint::CheckpointStore;
use crate::error::IndexerError;
use crate::types::{EventQuery, IndexStats, IndexedEvent, ProcessedEventMarker};

/// Storage for canonical transfer records.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert-or-ignore every event in one transaction.
    ///
    /// Either the whole batch commits or none of it does. Returns the number
    /// of rows actually inserted (duplicates by `event_key` are skipped).
    async fn insert_events(&self, events: &[IndexedEvent]) -> Result<u64, IndexerError>;

    /// First event (lowest log index) of a transaction.
    async fn event_by_tx_hash(&self, tx_hash: &str) -> Result<Option<IndexedEvent>, IndexerError>;

    /// All events with `from <= block_number <= to`, ordered by block then log index.
    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<IndexedEvent>, IndexerError>;

    /// All events in a single block.
    async fn events_at_block(&self, block_number: u64) -> Result<Vec<IndexedEvent>, IndexerError>;

    /// Filtered, paged query.
    async fn query_events(&self, query: &EventQuery) -> Result<Vec<IndexedEvent>, IndexerError>;

    /// Highest block number present in the `events` table.
    async fn latest_event_block(&self) -> Result<Option<u64>, IndexerError>;

    /// Aggregate counters.
    async fn event_stats(&self) -> Result<IndexStats, IndexerError>;

    /// `DELETE FROM events WHERE block_number >= ?`. Returns rows removed.
    async fn delete_events_from(&self, block_number: u64) -> Result<u64, IndexerError>;
}

/// Storage for processed-event markers.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Insert-or-ignore. Returns `true` if the marker was newly created.
    async fn insert_marker(&self, marker: &ProcessedEventMarker) -> Result<bool, IndexerError>;

    async fn marker_exists(&self, key: &str) -> Result<bool, IndexerError>;

    /// Delete markers for events at or above `block_number`. Returns rows removed.
    async fn delete_markers_from(&self, block_number: u64) -> Result<u64, IndexerError>;
}

/// Storage for the recorded canonical hash of each checked block.
#[async_trait]
pub trait BlockHashStore: Send + Sync {
    /// Upsert the hash recorded for `block_number`.
    async fn record_block_hash(
        &self,
        chain_id: &str,
        block_number: u64,
        hash: &str,
    ) -> Result<(), IndexerError>;

    async fn block_hash(&self, chain_id: &str, block_number: u64)
        -> Result<Option<String>, IndexerError>;

    /// Delete recorded hashes at or above `block_number`.
    async fn prune_block_hashes_from(
        &self,
        chain_id: &str,
        block_number: u64,
    ) -> Result<(), IndexerError>;
}

/// Counts reported by [`IndexStore::rollback_from`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub events_removed: u64,
    pub markers_removed: u64,
}

/// A complete backend for the pipeline.
#[async_trait]
pub trait IndexStore: EventStore + MarkerStore + BlockHashStore + CheckpointStore {
    /// Remove every event, marker, and recorded hash at or above `block_number`.
    ///
    /// The default runs the three deletes in sequence; SQL backends override
    /// it to run them inside one transaction.
    async fn rollback_from(
        &self,
        chain_id: &str,
        block_number: u64,
    ) -> Result<RollbackOutcome, IndexerError> {
        let events_removed = self.delete_events_from(block_number).await?;
        let markers_removed = self.delete_markers_from(block_number).await?;
        self.prune_block_hashes_from(chain_id, block_number).await?;
        Ok(RollbackOutcome {
            events_removed,
            markers_removed,
        })
    }
}
