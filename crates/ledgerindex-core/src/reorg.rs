//! Reorg monitor: verifies history at a safe depth and rolls back on mismatch.
//!
//! Every check looks at one block, `safe = head - depth`, and compares the
//! chain's current hash for it with the hash recorded on the previous check
//! of that height. A mismatch means the chain replaced history at or below
//! `safe`, so everything indexed from `safe` upward is removed and the
//! checkpoint moves to `safe - 1`. The observed hash is recorded after every
//! check so the next comparison has a fresh baseline.
//!
//! Reorgs deeper than `max_depth` are out of reach by construction.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointManager;
use crate::error::IndexerError;
use crate::idempotency::IdempotencyGate;
use crate::metrics::Metrics;
use crate::query::EventReader;
use crate::source::ChainSource;
use crate::store::IndexStore;

/// Upper bound used for "every block from here on" range reads.
const OPEN_END: u64 = i64::MAX as u64;

/// Reorg monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorgConfig {
    pub enabled: bool,
    /// Poll interval in milliseconds.
    pub check_interval_ms: u64,
    /// Distance behind head of the block that gets verified.
    pub depth: u64,
    /// Largest depth this deployment is prepared to recover from.
    pub max_depth: u64,
}

impl Default for ReorgConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 30_000,
            depth: 12,
            max_depth: 100,
        }
    }
}

impl ReorgConfig {
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.max_depth == 0 {
            return Err(IndexerError::Configuration("reorg.max_depth must be > 0".into()));
        }
        if self.depth > self.max_depth {
            return Err(IndexerError::Configuration(format!(
                "reorg.depth ({}) exceeds reorg.max_depth ({})",
                self.depth, self.max_depth
            )));
        }
        if self.enabled && self.check_interval_ms == 0 {
            return Err(IndexerError::Configuration(
                "reorg.check_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// The block verified for a given head.
    pub fn safe_block(&self, head: u64) -> u64 {
        head.saturating_sub(self.depth.min(self.max_depth))
    }
}

/// Describes a detected and rolled-back reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Chain head when the mismatch was found.
    pub detected_at: u64,
    /// The verified block; everything at or above it was removed.
    pub safe_block: u64,
    /// Hash recorded on the previous check.
    pub recorded_hash: String,
    /// Hash the chain reports now.
    pub canonical_hash: String,
    /// Checkpoint after rollback; `None` if it was cleared (rollback to genesis).
    pub checkpoint: Option<u64>,
    pub events_removed: u64,
    pub markers_removed: u64,
}

/// Lets the orchestrator quiesce ingestion around a rollback.
#[async_trait]
pub trait RollbackHook: Send + Sync {
    /// Called before anything is deleted.
    async fn before_rollback(&self, safe_block: u64);
    /// Called after a successful rollback.
    async fn after_rollback(&self, event: &ReorgEvent);
}

// ─── HaltSignal ───────────────────────────────────────────────────────────────

/// Shared "stop forward processing" flag, tripped by a failed rollback.
#[derive(Debug, Clone, Default)]
pub struct HaltSignal {
    reason: Arc<Mutex<Option<String>>>,
}

impl HaltSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.reason.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn trip(&self, reason: impl Into<String>) {
        *self.lock() = Some(reason.into());
    }

    /// Resume forward processing (operator action).
    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn is_halted(&self) -> bool {
        self.lock().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.lock().clone()
    }

    /// `Err(Halted)` while tripped.
    pub fn check(&self) -> Result<(), IndexerError> {
        match self.reason() {
            Some(reason) => Err(IndexerError::Halted { reason }),
            None => Ok(()),
        }
    }
}

// ─── ReorgMonitor ─────────────────────────────────────────────────────────────

/// Periodic safe-depth verifier.
pub struct ReorgMonitor {
    config: ReorgConfig,
    source: Arc<dyn ChainSource>,
    store: Arc<dyn IndexStore>,
    checkpoint: Arc<CheckpointManager>,
    reader: EventReader,
    gate: IdempotencyGate,
    hook: Option<Arc<dyn RollbackHook>>,
    halt: HaltSignal,
    metrics: Arc<Metrics>,
}

impl ReorgMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReorgConfig,
        source: Arc<dyn ChainSource>,
        store: Arc<dyn IndexStore>,
        checkpoint: Arc<CheckpointManager>,
        reader: EventReader,
        gate: IdempotencyGate,
        halt: HaltSignal,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            checkpoint,
            reader,
            gate,
            hook: None,
            halt,
            metrics,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn RollbackHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &ReorgConfig {
        &self.config
    }

    /// Verify the safe block for `head` and roll back on mismatch.
    ///
    /// Returns the reorg, if one was handled. Chain and store read failures
    /// are returned as-is (retry next tick); a failed rollback trips the halt
    /// signal and returns [`IndexerError::ReorgInconsistency`].
    pub async fn detect_and_handle_reorg(
        &self,
        head: u64,
    ) -> Result<Option<ReorgEvent>, IndexerError> {
        let chain_id = self.checkpoint.chain_id().to_string();
        let safe = self.config.safe_block(head);

        let canonical = self
            .source
            .block_by_number(safe)
            .await?
            .ok_or_else(|| IndexerError::Rpc(format!("block {safe} not found")))?;
        let recorded = self.store.block_hash(&chain_id, safe).await?;

        let mut handled = None;
        if let Some(recorded) = recorded.filter(|h| !h.is_empty()) {
            if !recorded.eq_ignore_ascii_case(&canonical.hash) {
                self.metrics.reorgs_detected.inc();
                tracing::warn!(
                    head,
                    safe_block = safe,
                    recorded = %recorded,
                    canonical = %canonical.hash,
                    "Reorg detected"
                );
                handled = Some(self.rollback(head, safe, recorded, canonical.hash.clone()).await?);
            }
        }

        if let Err(e) = self
            .store
            .record_block_hash(&chain_id, safe, &canonical.hash)
            .await
        {
            tracing::warn!(block = safe, error = %e, "failed to record block hash");
        }
        Ok(handled)
    }

    async fn rollback(
        &self,
        head: u64,
        safe: u64,
        recorded_hash: String,
        canonical_hash: String,
    ) -> Result<ReorgEvent, IndexerError> {
        if let Some(hook) = &self.hook {
            hook.before_rollback(safe).await;
        }

        let chain_id = self.checkpoint.chain_id();
        let result = async {
            let doomed = self.store.events_in_range(safe, OPEN_END).await?;
            let outcome = self.store.rollback_from(chain_id, safe).await?;
            let checkpoint = match safe.checked_sub(1) {
                Some(target) => {
                    self.checkpoint.rewind_to(target).await?;
                    Some(target)
                }
                None => {
                    self.checkpoint.reset().await?;
                    None
                }
            };
            Ok::<_, IndexerError>((doomed, outcome, checkpoint))
        }
        .await;

        let (doomed, outcome, checkpoint) = match result {
            Ok(done) => done,
            Err(e) => {
                let reason = e.to_string();
                self.halt
                    .trip(format!("rollback from block {safe} failed: {reason}"));
                tracing::error!(
                    safe_block = safe,
                    error = %reason,
                    "Rollback failed, halting ingestion"
                );
                return Err(IndexerError::ReorgInconsistency {
                    block_number: safe,
                    reason,
                });
            }
        };

        self.reader.invalidate_events(&doomed).await;
        let keys: Vec<String> = doomed.iter().map(|e| e.event_key.clone()).collect();
        self.gate.forget(&keys).await;

        let event = ReorgEvent {
            detected_at: head,
            safe_block: safe,
            recorded_hash,
            canonical_hash,
            checkpoint,
            events_removed: outcome.events_removed,
            markers_removed: outcome.markers_removed,
        };
        tracing::info!(
            safe_block = safe,
            events_removed = event.events_removed,
            markers_removed = event.markers_removed,
            checkpoint = ?event.checkpoint,
            "Rollback complete"
        );

        if let Some(hook) = &self.hook {
            hook.after_rollback(&event).await;
        }
        Ok(event)
    }

    /// Poll until `cancel` fires.
    ///
    /// Returns `Err` only when a rollback failed; ingestion is halted then.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexerError> {
        if !self.config.enabled {
            tracing::info!("Reorg monitor disabled");
            return Ok(());
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.check_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        tracing::info!(
            depth = self.config.depth,
            interval_ms = self.config.check_interval_ms,
            "Reorg monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reorg monitor stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if self.halt.is_halted() {
                        continue;
                    }
                    let head = match self.source.current_block_number().await {
                        Ok(head) => head,
                        Err(e) => {
                            tracing::warn!(error = %e, "Reorg check skipped: head unavailable");
                            continue;
                        }
                    };
                    match self.detect_and_handle_reorg(head).await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => tracing::warn!(head, error = %e, "Reorg check failed, retrying next tick"),
                    }
                }
            }
        }
    }
}
