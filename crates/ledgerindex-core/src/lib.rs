//! ledgerindex-core — the reorg-safe transfer indexing pipeline.
//!
//! # Architecture
//!
//! ```text
//! ChainSource ─► Orchestrator ─► IdempotencyGate ─► BatchWriter ─► IndexStore
//!                     │                                  │
//!                     ├── BlockProgress ─► CheckpointManager
//!                     └── ReorgMonitor (safe-depth poll, rollback)
//!
//! EventReader ─► CacheAside ─► Cache   (never authoritative)
//!      └──────────────────────► IndexStore
//! ```
//!
//! The orchestrator itself lives in `ledgerindex-evm`; this crate holds the
//! components and the traits they depend on.

pub mod batch;
pub mod cache;
pub mod checkpoint;
pub mod error;
pub mod idempotency;
pub mod indexer;
pub mod key;
pub mod memory;
pub mod metrics;
pub mod progress;
pub mod query;
pub mod reorg;
pub mod retry;
pub mod source;
pub mod store;
pub mod types;

pub use batch::{BatchConfig, BatchWriter, DeadLetter, FlushListener, FlushOutcome};
pub use cache::{Cache, CacheAside, CacheKind, CacheTtlConfig, Cacheable};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore};
pub use error::IndexerError;
pub use idempotency::IdempotencyGate;
pub use indexer::{IndexerConfig, IndexerState};
pub use key::EventKey;
pub use memory::{MemoryCache, MemoryStore};
pub use metrics::{Metrics, MetricsSnapshot};
pub use progress::BlockProgress;
pub use query::EventReader;
pub use reorg::{HaltSignal, ReorgConfig, ReorgEvent, ReorgMonitor, RollbackHook};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{ChainSource, LogSubscription, SourceEvent};
pub use store::{BlockHashStore, EventStore, IndexStore, MarkerStore, RollbackOutcome};
pub use types::{
    BlockSummary, EventQuery, IndexStats, IndexedEvent, LogFilter, ProcessedEventMarker,
    TransferKind, TransferLog,
};
