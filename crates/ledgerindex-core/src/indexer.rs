//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::cache::CacheTtlConfig;
use crate::error::IndexerError;
use crate::reorg::ReorgConfig;
use crate::retry::RetryConfig;
use crate::types::is_valid_address;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Chain identifier; keys the checkpoint row.
    pub chain_id: String,
    /// First block on a cold start (no checkpoint).
    pub start_block: u64,
    /// Contracts to index when none are passed explicitly (replay, CLI `run`).
    pub addresses: Vec<String>,
    /// Blocks per replay sub-range.
    pub replay_chunk_size: u64,
    /// Pause between replay sub-ranges (milliseconds).
    pub replay_pause_ms: u64,
    /// Maximum concurrently dispatched live events.
    pub max_concurrent_workers: usize,
    /// How many blocks to request per `eth_getLogs` call.
    pub log_range_size: u64,
    /// Live-mode polling interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Capacity of each subscription's log channel.
    pub subscription_buffer: usize,
    /// How often live progress is committed to the checkpoint (milliseconds).
    pub checkpoint_interval_ms: u64,
    pub batch: BatchConfig,
    pub reorg: ReorgConfig,
    pub cache: CacheTtlConfig,
    pub retry: RetryConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain_id: "1".into(),
            start_block: 0,
            addresses: Vec::new(),
            replay_chunk_size: 1_000,
            replay_pause_ms: 100,
            max_concurrent_workers: 10,
            log_range_size: 1_000,
            poll_interval_ms: 2_000,
            subscription_buffer: 512,
            checkpoint_interval_ms: 1_000,
            batch: BatchConfig::default(),
            reorg: ReorgConfig::default(),
            cache: CacheTtlConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        let positive = [
            ("replay_chunk_size", self.replay_chunk_size),
            ("log_range_size", self.log_range_size),
            ("poll_interval_ms", self.poll_interval_ms),
            ("checkpoint_interval_ms", self.checkpoint_interval_ms),
            ("batch.flush_timeout_ms", self.batch.flush_timeout_ms),
            ("max_concurrent_workers", self.max_concurrent_workers as u64),
            ("subscription_buffer", self.subscription_buffer as u64),
            ("batch.batch_size", self.batch.batch_size as u64),
            ("batch.buffer_factor", self.batch.buffer_factor as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(IndexerError::Configuration(format!("{name} must be > 0")));
            }
        }
        if self.chain_id.trim().is_empty() {
            return Err(IndexerError::Configuration("chain_id must not be empty".into()));
        }
        if let Some(bad) = self.addresses.iter().find(|a| !is_valid_address(a)) {
            return Err(IndexerError::Configuration(format!("invalid contract address: {bad}")));
        }
        if self.retry.multiplier < 1.0 || !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(IndexerError::Configuration(
                "retry.multiplier must be >= 1 and retry.jitter_fraction within [0, 1]".into(),
            ));
        }
        self.reorg.validate()
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Catching up from the checkpoint to the chain head.
    Backfilling,
    /// Following the chain tip.
    Live,
    /// Rolling back after a reorg.
    ReorgRecovery,
    /// A rollback failed; forward processing is refused.
    Halted,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Halted => write!(f, "halted"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
