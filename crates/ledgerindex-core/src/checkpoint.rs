//! Checkpoint manager: persists the last fully-processed block for crash recovery.
//!
//! A checkpoint is one row per chain id. Reads go through an in-memory copy;
//! writes go to the durable store first and then refresh that copy. Forward
//! processing only ever moves the checkpoint up ([`CheckpointManager::advance`]);
//! the reorg monitor is the only caller of [`CheckpointManager::rewind_to`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::IndexerError;

/// A persisted checkpoint for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Chain identifier (e.g. `"1"` or `"ethereum"`).
    pub chain_id: String,
    /// Last fully processed block number.
    pub block_number: u64,
    /// Hash of that block, when known.
    pub block_hash: Option<String>,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// Implementations include `MemoryStore`, `SqliteStorage`, and `PostgresStorage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a chain.
    async fn load_checkpoint(&self, chain_id: &str) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IndexerError>;

    /// Delete a checkpoint (e.g. when resetting an indexer).
    async fn delete_checkpoint(&self, chain_id: &str) -> Result<(), IndexerError>;
}

/// Manages checkpoint reads/writes for one chain.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    chain_id: String,
    /// `None` until the first load or write.
    cached: Mutex<Option<Checkpoint>>,
    /// Bumped by every rewind or reset.
    generation: AtomicU64,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, chain_id: impl Into<String>) -> Self {
        Self {
            store,
            chain_id: chain_id.into(),
            cached: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// The saved checkpoint, or `None` if nothing was ever written.
    pub async fn load(&self) -> Result<Option<Checkpoint>, IndexerError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = self.store.load_checkpoint(&self.chain_id).await?;
        }
        Ok(cached.clone())
    }

    /// Last processed block; `0` when no checkpoint exists.
    pub async fn last_processed_block(&self) -> Result<u64, IndexerError> {
        Ok(self.load().await?.map(|cp| cp.block_number).unwrap_or(0))
    }

    /// Move the checkpoint forward to `block_number`.
    ///
    /// A no-op (returns `false`) when the checkpoint is already at or past
    /// `block_number`, so concurrent writers can never move it backward.
    pub async fn advance(
        &self,
        block_number: u64,
        block_hash: Option<&str>,
    ) -> Result<bool, IndexerError> {
        self.advance_inner(None, block_number, block_hash).await
    }

    /// Current rewind generation. Pair with [`advance_if_generation`](Self::advance_if_generation).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Like [`advance`](Self::advance), but refuses if a rewind happened
    /// since `generation` was read. Callers that compute the target block
    /// ahead of time use this so a rollback in between cannot be undone.
    pub async fn advance_if_generation(
        &self,
        generation: u64,
        block_number: u64,
        block_hash: Option<&str>,
    ) -> Result<bool, IndexerError> {
        self.advance_inner(Some(generation), block_number, block_hash)
            .await
    }

    async fn advance_inner(
        &self,
        generation: Option<u64>,
        block_number: u64,
        block_hash: Option<&str>,
    ) -> Result<bool, IndexerError> {
        let mut cached = self.cached.lock().await;
        if generation.is_some_and(|g| g != self.generation()) {
            return Ok(false);
        }
        if cached.is_none() {
            *cached = self.store.load_checkpoint(&self.chain_id).await?;
        }
        if cached.as_ref().is_some_and(|cp| cp.block_number >= block_number) {
            return Ok(false);
        }
        let cp = self.checkpoint(block_number, block_hash);
        self.store.save_checkpoint(&cp).await?;
        tracing::debug!(chain = %self.chain_id, block = block_number, "checkpoint advanced");
        *cached = Some(cp);
        Ok(true)
    }

    /// Unconditionally move the checkpoint to `block_number` (reorg recovery).
    pub async fn rewind_to(&self, block_number: u64) -> Result<(), IndexerError> {
        let mut cached = self.cached.lock().await;
        let cp = self.checkpoint(block_number, None);
        self.store.save_checkpoint(&cp).await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(chain = %self.chain_id, block = block_number, "checkpoint rewound");
        *cached = Some(cp);
        Ok(())
    }

    /// Delete the checkpoint; the next start is a cold start.
    pub async fn reset(&self) -> Result<(), IndexerError> {
        let mut cached = self.cached.lock().await;
        self.store.delete_checkpoint(&self.chain_id).await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        *cached = None;
        Ok(())
    }

    fn checkpoint(&self, block_number: u64, block_hash: Option<&str>) -> Checkpoint {
        Checkpoint {
            chain_id: self.chain_id.clone(),
            block_number,
            block_hash: block_hash.map(str::to_string),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}
