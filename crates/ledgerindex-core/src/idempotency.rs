//! Idempotency gate: bounds duplicate durable writes under redelivery.
//!
//! This is an optimization layered on top of insert-or-ignore persistence,
//! not the sole dedup mechanism: lookups fail open, and two racing deliveries
//! of the same event may both pass the gate. The unique `event_key` column
//! still guarantees a single row.

use std::sync::Arc;

use crate::cache::{keys, CacheAside, CacheKind};
use crate::error::IndexerError;
use crate::metrics::Metrics;
use crate::store::MarkerStore;
use crate::types::ProcessedEventMarker;

/// Dedup guard keyed by [`EventKey`](crate::key::EventKey) strings.
#[derive(Clone)]
pub struct IdempotencyGate {
    markers: Arc<dyn MarkerStore>,
    cache: CacheAside,
    metrics: Arc<Metrics>,
}

impl IdempotencyGate {
    pub fn new(markers: Arc<dyn MarkerStore>, cache: CacheAside, metrics: Arc<Metrics>) -> Self {
        Self {
            markers,
            cache,
            metrics,
        }
    }

    /// Returns `true` if `key` was already durably processed.
    ///
    /// Cache first, then the marker store; a store hit is written back to the
    /// cache. Any error is logged and reported as "not processed".
    pub async fn is_processed(&self, key: &str) -> bool {
        let cache_key = keys::processed(key);
        let lookup = self
            .cache
            .get_or_load(CacheKind::Processed, &cache_key, || self.markers.marker_exists(key))
            .await;
        match lookup {
            Ok(seen) => {
                if seen {
                    self.metrics.duplicates_skipped.inc();
                }
                seen
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "idempotency lookup failed, treating as unprocessed");
                false
            }
        }
    }

    /// Record `key` as processed: marker store first, then cache.
    ///
    /// Safe to call repeatedly; returns `true` only for the call that created
    /// the marker.
    pub async fn mark_processed(&self, key: &str, block_number: u64) -> Result<bool, IndexerError> {
        let created = self
            .markers
            .insert_marker(&ProcessedEventMarker::new(key, block_number))
            .await?;
        self.cache
            .put(CacheKind::Processed, &keys::processed(key), &true)
            .await;
        Ok(created)
    }

    /// Drop cached markers (after a rollback removed the durable rows).
    pub async fn forget(&self, event_keys: &[String]) {
        let cache_keys: Vec<String> = event_keys.iter().map(|k| keys::processed(k)).collect();
        self.cache.invalidate(&cache_keys).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTtlConfig;
    use crate::memory::{MemoryCache, MemoryStore};
    use std::time::Duration;

    fn gate() -> (IdempotencyGate, Arc<MemoryStore>, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let aside = CacheAside::new(cache.clone(), CacheTtlConfig::default(), metrics.clone());
        (IdempotencyGate::new(store.clone(), aside, metrics), store, cache)
    }

    #[tokio::test]
    async fn unmarked_key_is_not_processed() {
        let (gate, _, _) = gate();
        assert!(!gate.is_processed("nft:0xc:0x1:0xt").await);
    }

    #[tokio::test]
    async fn mark_then_check() {
        let (gate, store, cache) = gate();
        assert!(gate.mark_processed("k1", 10).await.unwrap());
        assert!(store.marker_exists("k1").await.unwrap());
        assert!(cache.contains(&keys::processed("k1")));
        assert!(gate.is_processed("k1").await);
    }

    #[tokio::test]
    async fn mark_is_idempotent() {
        let (gate, store, _) = gate();
        assert!(gate.mark_processed("k1", 10).await.unwrap());
        assert!(!gate.mark_processed("k1", 10).await.unwrap());
        assert_eq!(store.marker_count(), 1);
    }

    #[tokio::test]
    async fn store_hit_reads_through_into_cache() {
        let (gate, store, cache) = gate();
        store
            .insert_marker(&ProcessedEventMarker::new("k2", 5))
            .await
            .unwrap();
        assert!(gate.is_processed("k2").await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.contains(&keys::processed("k2")));
    }

    #[tokio::test]
    async fn lookup_failure_fails_open() {
        let (gate, store, cache) = gate();
        cache.set_unavailable(true);
        store.fail_reads(true);
        assert!(!gate.is_processed("k3").await);
    }

    #[tokio::test]
    async fn cache_outage_still_uses_store() {
        let (gate, store, cache) = gate();
        store
            .insert_marker(&ProcessedEventMarker::new("k4", 5))
            .await
            .unwrap();
        cache.set_unavailable(true);
        assert!(gate.is_processed("k4").await);
    }

    #[tokio::test]
    async fn concurrent_marks_leave_one_marker() {
        let (gate, store, _) = gate();
        let a = gate.clone();
        let b = gate.clone();
        let (ra, rb) = tokio::join!(a.mark_processed("race", 7), b.mark_processed("race", 7));
        assert!(ra.unwrap() ^ rb.unwrap());
        assert_eq!(store.marker_count(), 1);
    }
}
