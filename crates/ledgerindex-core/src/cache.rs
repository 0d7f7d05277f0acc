//! Cache-aside layer.
//!
//! The cache is never authoritative. Reads try the cache, fall back to the
//! durable store on a miss or on any cache failure, and populate the cache in
//! a detached task when the loaded value is worth keeping. Writes invalidate
//! by deleting keys; nothing is updated in place.
//!
//! Entity types opt in by implementing [`Cacheable`] and picking a
//! [`CacheKind`], which selects the TTL.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::metrics::Metrics;
use crate::types::{IndexStats, IndexedEvent};

/// A string key/value cache with per-entry TTL.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, IndexerError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), IndexerError>;
    async fn delete(&self, keys: &[String]) -> Result<(), IndexerError>;
}

// ─── TTL policy ───────────────────────────────────────────────────────────────

/// Cached entity families; each has its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Single event by transaction hash. Effectively immutable.
    EventByTx,
    /// Filtered event list.
    EventQuery,
    /// Events in a block or block range.
    EventsByBlock,
    /// Highest indexed block.
    LatestBlock,
    /// Aggregate counters.
    Stats,
    /// Idempotency marker.
    Processed,
}

/// Per-entity TTLs in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    pub event_by_tx_secs: u64,
    pub event_query_secs: u64,
    pub events_by_block_secs: u64,
    pub latest_block_secs: u64,
    pub stats_secs: u64,
    pub processed_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            event_by_tx_secs: 300,
            event_query_secs: 600,
            events_by_block_secs: 120,
            latest_block_secs: 30,
            stats_secs: 60,
            processed_secs: 86_400,
        }
    }
}

impl CacheTtlConfig {
    pub fn ttl(&self, kind: CacheKind) -> Duration {
        let secs = match kind {
            CacheKind::EventByTx => self.event_by_tx_secs,
            CacheKind::EventQuery => self.event_query_secs,
            CacheKind::EventsByBlock => self.events_by_block_secs,
            CacheKind::LatestBlock => self.latest_block_secs,
            CacheKind::Stats => self.stats_secs,
            CacheKind::Processed => self.processed_secs,
        };
        Duration::from_secs(secs)
    }
}

// ─── Cacheable ────────────────────────────────────────────────────────────────

/// Values that may be stored by [`CacheAside`].
///
/// Empty results are not cached so a later write is visible immediately.
pub trait Cacheable: Serialize + DeserializeOwned + Send + 'static {
    fn worth_caching(&self) -> bool {
        true
    }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> Cacheable for Vec<T> {
    fn worth_caching(&self) -> bool {
        !self.is_empty()
    }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> Cacheable for Option<T> {
    fn worth_caching(&self) -> bool {
        self.is_some()
    }
}

impl Cacheable for bool {
    fn worth_caching(&self) -> bool {
        *self
    }
}

impl Cacheable for IndexedEvent {}

impl Cacheable for IndexStats {
    fn worth_caching(&self) -> bool {
        self.total_events > 0
    }
}

// ─── Keys ─────────────────────────────────────────────────────────────────────

/// Cache key builders. List keys embed a query epoch so a bump makes every
/// older list entry unreachable.
pub mod keys {
    use crate::types::EventQuery;

    pub fn event_by_tx(tx_hash: &str) -> String {
        format!("event:tx:{}", tx_hash.to_ascii_lowercase())
    }

    pub fn event_query(epoch: u64, query: &EventQuery) -> String {
        format!("events:q:{epoch}:{}", query.fingerprint())
    }

    pub fn block_range(epoch: u64, from: u64, to: u64) -> String {
        format!("events:range:{epoch}:{from}:{to}")
    }

    pub fn block(epoch: u64, block_number: u64) -> String {
        format!("events:block:{epoch}:{block_number}")
    }

    pub fn latest_block(epoch: u64) -> String {
        format!("block:latest:{epoch}")
    }

    pub fn stats(epoch: u64) -> String {
        format!("stats:{epoch}")
    }

    pub fn processed(event_key: &str) -> String {
        format!("processed:{event_key}")
    }
}

// ─── CacheAside ───────────────────────────────────────────────────────────────

/// Read-through / invalidate-on-write wrapper around a [`Cache`].
#[derive(Clone)]
pub struct CacheAside {
    cache: Arc<dyn Cache>,
    ttl: CacheTtlConfig,
    metrics: Arc<Metrics>,
}

impl CacheAside {
    pub fn new(cache: Arc<dyn Cache>, ttl: CacheTtlConfig, metrics: Arc<Metrics>) -> Self {
        Self { cache, ttl, metrics }
    }

    /// Return the cached value for `key`, or load it from the store.
    ///
    /// Cache errors and undecodable entries count as misses. Only `load`
    /// can fail the call.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        kind: CacheKind,
        key: &str,
        load: F,
    ) -> Result<T, IndexerError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        if let Some(hit) = self.lookup::<T>(key).await {
            return Ok(hit);
        }

        let value = load().await?;
        if value.worth_caching() {
            self.populate(kind, key, &value);
        }
        Ok(value)
    }

    /// Synchronously store `value`. Errors are logged, not returned.
    pub async fn put<T: Cacheable>(&self, kind: CacheKind, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache encode failed");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, raw, self.ttl.ttl(kind)).await {
            self.metrics.cache_errors.inc();
            tracing::warn!(key, error = %e, "cache set failed");
        }
    }

    /// Delete `keys`. Errors are logged; the entries will expire by TTL.
    pub async fn invalidate(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.cache.delete(keys).await {
            self.metrics.cache_errors.inc();
            tracing::warn!(count = keys.len(), error = %e, "cache invalidation failed");
        }
    }

    async fn lookup<T: Cacheable>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    self.metrics.cache_hits.inc();
                    Some(value)
                }
                Err(e) => {
                    tracing::debug!(key, error = %e, "undecodable cache entry, treating as miss");
                    self.metrics.cache_misses.inc();
                    None
                }
            },
            Ok(None) => {
                self.metrics.cache_misses.inc();
                None
            }
            Err(e) => {
                self.metrics.cache_errors.inc();
                tracing::warn!(key, error = %e, "cache unavailable, reading store");
                None
            }
        }
    }

    /// Fire-and-forget population, off the caller's critical path.
    fn populate<T: Cacheable>(&self, kind: CacheKind, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache encode failed");
                return;
            }
        };
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let ttl = self.ttl.ttl(kind);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.set(&key, raw, ttl).await {
                metrics.cache_errors.inc();
                tracing::debug!(key = %key, error = %e, "background cache populate failed");
            }
        });
    }
}
