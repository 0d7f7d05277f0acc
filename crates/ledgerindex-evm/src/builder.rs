//! Fluent builder API for creating indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledgerindex_evm::{EvmChainSource, EvmSourceConfig, HttpEvmClient, IndexerBuilder};
//! use ledgerindex_storage::{MemoryCache, MemoryStore};
//!
//! # async fn run() -> Result<(), ledgerindex_core::IndexerError> {
//! let builder = IndexerBuilder::new()
//!     .chain_id("1")
//!     .start_block(19_000_000)
//!     .address("0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d")
//!     .batch_size(200)
//!     .reorg_depth(12);
//!
//! let client = HttpEvmClient::default_for("http://localhost:8545")?;
//! let source = Arc::new(EvmChainSource::new(client, builder.source_config()));
//! let indexer = builder.build(source, Arc::new(MemoryStore::new()), Arc::new(MemoryCache::new()))?;
//! indexer.start_indexing(&[]).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ledgerindex_core::cache::Cache;
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::indexer::IndexerConfig;
use ledgerindex_core::source::ChainSource;
use ledgerindex_core::store::IndexStore;

use crate::fetcher::EvmSourceConfig;
use crate::index_loop::Indexer;

/// Fluent builder for [`IndexerConfig`] and [`Indexer`].
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the chain id (keys the checkpoint).
    pub fn chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.config.chain_id = chain_id.into();
        self
    }

    /// Set the first block of a cold start.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Add a contract to index.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.addresses.push(address.into());
        self
    }

    pub fn addresses<I, A>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.config
            .addresses
            .extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Set the number of records per bulk insert.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch.batch_size = size;
        self
    }

    pub fn flush_timeout_ms(mut self, ms: u64) -> Self {
        self.config.batch.flush_timeout_ms = ms;
        self
    }

    /// Set the distance behind head of the block the reorg monitor verifies.
    pub fn reorg_depth(mut self, depth: u64) -> Self {
        self.config.reorg.depth = depth;
        self
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.reorg.max_depth = depth;
        self
    }

    pub fn reorg_interval_ms(mut self, ms: u64) -> Self {
        self.config.reorg.check_interval_ms = ms;
        self
    }

    /// Set the number of blocks per replay sub-range.
    pub fn replay_chunk_size(mut self, size: u64) -> Self {
        self.config.replay_chunk_size = size;
        self
    }

    pub fn max_concurrent_workers(mut self, n: usize) -> Self {
        self.config.max_concurrent_workers = n;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Chain source settings derived from the configuration.
    pub fn source_config(&self) -> EvmSourceConfig {
        source_config(&self.config)
    }

    /// Validate the configuration and assemble the pipeline.
    pub fn build<S: IndexStore + 'static>(
        self,
        source: Arc<dyn ChainSource>,
        store: Arc<S>,
        cache: Arc<dyn Cache>,
    ) -> Result<Indexer, IndexerError> {
        Indexer::new(self.config, source, store, cache)
    }
}

/// [`EvmSourceConfig`] matching an [`IndexerConfig`].
pub fn source_config(config: &IndexerConfig) -> EvmSourceConfig {
    EvmSourceConfig {
        log_range_size: config.log_range_size,
        poll_interval: Duration::from_millis(config.poll_interval_ms),
        buffer: config.subscription_buffer,
        ..EvmSourceConfig::default()
    }
}
