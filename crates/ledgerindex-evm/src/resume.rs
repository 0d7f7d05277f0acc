//! Resume and bounded replay.
//!
//! Both walk a block range in fixed-size sub-ranges. After each sub-range
//! its events are flushed to the store and only then is the checkpoint
//! advanced, so the checkpoint always covers fully persisted blocks and a
//! failed replay can be restarted from the failing sub-range.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ledgerindex_core::batch::FlushOutcome;
use ledgerindex_core::checkpoint::CheckpointManager;
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::reorg::HaltSignal;
use ledgerindex_core::retry::RetryPolicy;
use ledgerindex_core::source::ChainSource;

/// The part of the pipeline a replay drives.
#[async_trait]
pub trait RangeProcessor: Send + Sync {
    /// Fetch and dispatch every transfer in `[from, to]` for `addresses`.
    async fn process_range(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
    ) -> Result<(), IndexerError>;

    /// Persist everything dispatched so far.
    async fn flush(&self) -> Result<FlushOutcome, IndexerError>;
}

/// Drives cold start, resume, and replay against the checkpoint.
pub struct ResumeManager {
    start_block: u64,
    chunk_size: u64,
    pause: Duration,
    checkpoint: Arc<CheckpointManager>,
    source: Arc<dyn ChainSource>,
    processor: Arc<dyn RangeProcessor>,
    halt: HaltSignal,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ResumeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start_block: u64,
        chunk_size: u64,
        pause: Duration,
        checkpoint: Arc<CheckpointManager>,
        source: Arc<dyn ChainSource>,
        processor: Arc<dyn RangeProcessor>,
        halt: HaltSignal,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            start_block,
            chunk_size: chunk_size.max(1),
            pause,
            checkpoint,
            source,
            processor,
            halt,
            retry,
            cancel,
        }
    }

    /// Catch up from the checkpoint to the current head.
    ///
    /// Returns the first block the live subscription must start from; every
    /// block below it has been replayed and checkpointed.
    pub async fn resume_from_last_block(&self, addresses: &[String]) -> Result<u64, IndexerError> {
        let start = match self.checkpoint.load().await? {
            Some(cp) => {
                tracing::info!(
                    chain = %self.checkpoint.chain_id(),
                    checkpoint = cp.block_number,
                    "Resuming from checkpoint"
                );
                cp.block_number + 1
            }
            None => {
                tracing::info!(
                    chain = %self.checkpoint.chain_id(),
                    start_block = self.start_block,
                    "No checkpoint, cold start"
                );
                self.start_block
            }
        };

        let head = self
            .retry
            .retry("current block number", Some(&self.cancel), || {
                self.source.current_block_number()
            })
            .await?;

        if start > head {
            return Ok(start);
        }
        tracing::info!(from = start, to = head, "Catching up to head");
        self.replay_events(start, head, addresses).await?;
        Ok(head + 1)
    }

    /// Process `[from, to]` in sub-ranges, checkpointing after each.
    ///
    /// A sub-range failure aborts with [`IndexerError::ReplayFailed`] naming
    /// the failing range; the checkpoint covers every sub-range before it.
    pub async fn replay_events(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
    ) -> Result<(), IndexerError> {
        if from > to {
            return Err(IndexerError::Configuration(format!(
                "invalid replay range: from {from} > to {to}"
            )));
        }
        self.halt.check()?;

        let mut cur = from;
        loop {
            let end = cur.saturating_add(self.chunk_size).min(to);
            if let Err(e) = self.replay_sub_range(cur, end, addresses).await {
                tracing::error!(from = cur, to = end, error = %e, "Replay sub-range failed");
                return Err(IndexerError::ReplayFailed {
                    from: cur,
                    to: end,
                    reason: e.to_string(),
                });
            }
            tracing::info!(from = cur, to = end, "Replay sub-range complete");

            if end >= to {
                return Ok(());
            }
            cur = end + 1;

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(IndexerError::Cancelled),
                _ = tokio::time::sleep(self.pause) => {}
            }
        }
    }

    async fn replay_sub_range(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
    ) -> Result<(), IndexerError> {
        self.halt.check()?;
        let generation = self.checkpoint.generation();
        self.processor.process_range(from, to, addresses).await?;

        let outcome = self.processor.flush().await?;
        if outcome.dead_lettered > 0 {
            return Err(IndexerError::Storage(format!(
                "{} event(s) could not be persisted",
                outcome.dead_lettered
            )));
        }
        self.checkpoint
            .advance_if_generation(generation, to, None)
            .await?;
        Ok(())
    }
}
