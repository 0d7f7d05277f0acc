//! In-memory store and cache.
//!
//! `MemoryStore` implements every storage trait with the same uniqueness
//! rules as the SQL backends. `MemoryCache` is a TTL map implementing
//! [`Cache`]. Both can be told to fail, which is how the pipeline's
//! degradation paths are exercised in tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::Cache;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::IndexerError;
use crate::store::{BlockHashStore, EventStore, IndexStore, MarkerStore};
use crate::types::{EventQuery, IndexStats, IndexedEvent, ProcessedEventMarker};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sorted(mut events: Vec<IndexedEvent>) -> Vec<IndexedEvent> {
    events.sort_by(|a, b| {
        (a.block_number, a.log_index, &a.event_key).cmp(&(b.block_number, b.log_index, &b.event_key))
    });
    events
}

// ─── MemoryStore ──────────────────────────────────────────────────────────────

/// In-memory indexer storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<HashMap<String, IndexedEvent>>,
    markers: Mutex<HashMap<String, ProcessedEventMarker>>,
    block_hashes: Mutex<HashMap<(String, u64), String>>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    insert_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write return a storage error until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every read return a storage error until switched off.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Total number of stored events.
    pub fn event_count(&self) -> usize {
        lock(&self.events).len()
    }

    /// Total number of stored markers.
    pub fn marker_count(&self) -> usize {
        lock(&self.markers).len()
    }

    /// Every stored event, ordered by block and log index.
    pub fn all_events(&self) -> Vec<IndexedEvent> {
        sorted(lock(&self.events).values().cloned().collect())
    }

    /// Number of successful `insert_events` calls (one per flushed batch).
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<(), IndexerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IndexerError::Storage("memory store: writes disabled".into()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), IndexerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(IndexerError::Storage("memory store: reads disabled".into()));
        }
        Ok(())
    }

    fn filtered(&self, pred: impl Fn(&IndexedEvent) -> bool) -> Vec<IndexedEvent> {
        sorted(lock(&self.events).values().filter(|e| pred(e)).cloned().collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_events(&self, events: &[IndexedEvent]) -> Result<u64, IndexerError> {
        self.check_write()?;
        let mut table = lock(&self.events);
        let mut inserted = 0;
        for event in events {
            if !table.contains_key(&event.event_key) {
                table.insert(event.event_key.clone(), event.clone());
                inserted += 1;
            }
        }
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        Ok(inserted)
    }

    async fn event_by_tx_hash(&self, tx_hash: &str) -> Result<Option<IndexedEvent>, IndexerError> {
        self.check_read()?;
        Ok(self
            .filtered(|e| e.tx_hash.eq_ignore_ascii_case(tx_hash))
            .into_iter()
            .next())
    }

    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<IndexedEvent>, IndexerError> {
        self.check_read()?;
        Ok(self.filtered(|e| e.block_number >= from && e.block_number <= to))
    }

    async fn events_at_block(&self, block_number: u64) -> Result<Vec<IndexedEvent>, IndexerError> {
        self.check_read()?;
        Ok(self.filtered(|e| e.block_number == block_number))
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<IndexedEvent>, IndexerError> {
        self.check_read()?;
        Ok(self
            .filtered(|e| query.matches(e))
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect())
    }

    async fn latest_event_block(&self) -> Result<Option<u64>, IndexerError> {
        self.check_read()?;
        Ok(lock(&self.events).values().map(|e| e.block_number).max())
    }

    async fn event_stats(&self) -> Result<IndexStats, IndexerError> {
        self.check_read()?;
        let table = lock(&self.events);
        let contracts: BTreeSet<&str> = table.values().map(|e| e.contract.as_str()).collect();
        Ok(IndexStats {
            total_events: table.len() as u64,
            contracts: contracts.len() as u64,
            latest_block: table.values().map(|e| e.block_number).max(),
        })
    }

    async fn delete_events_from(&self, block_number: u64) -> Result<u64, IndexerError> {
        self.check_write()?;
        let mut table = lock(&self.events);
        let before = table.len();
        table.retain(|_, e| e.block_number < block_number);
        Ok((before - table.len()) as u64)
    }
}

#[async_trait]
impl MarkerStore for MemoryStore {
    async fn insert_marker(&self, marker: &ProcessedEventMarker) -> Result<bool, IndexerError> {
        self.check_write()?;
        let mut table = lock(&self.markers);
        if table.contains_key(&marker.key) {
            return Ok(false);
        }
        table.insert(marker.key.clone(), marker.clone());
        Ok(true)
    }

    async fn marker_exists(&self, key: &str) -> Result<bool, IndexerError> {
        self.check_read()?;
        Ok(lock(&self.markers).contains_key(key))
    }

    async fn delete_markers_from(&self, block_number: u64) -> Result<u64, IndexerError> {
        self.check_write()?;
        let mut table = lock(&self.markers);
        let before = table.len();
        table.retain(|_, m| m.block_number < block_number);
        Ok((before - table.len()) as u64)
    }
}

#[async_trait]
impl BlockHashStore for MemoryStore {
    async fn record_block_hash(
        &self,
        chain_id: &str,
        block_number: u64,
        hash: &str,
    ) -> Result<(), IndexerError> {
        self.check_write()?;
        lock(&self.block_hashes).insert((chain_id.to_string(), block_number), hash.to_string());
        Ok(())
    }

    async fn block_hash(
        &self,
        chain_id: &str,
        block_number: u64,
    ) -> Result<Option<String>, IndexerError> {
        self.check_read()?;
        Ok(lock(&self.block_hashes)
            .get(&(chain_id.to_string(), block_number))
            .cloned())
    }

    async fn prune_block_hashes_from(
        &self,
        chain_id: &str,
        block_number: u64,
    ) -> Result<(), IndexerError> {
        self.check_write()?;
        lock(&self.block_hashes).retain(|(chain, num), _| chain != chain_id || *num < block_number);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self, chain_id: &str) -> Result<Option<Checkpoint>, IndexerError> {
        self.check_read()?;
        Ok(lock(&self.checkpoints).get(chain_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IndexerError> {
        self.check_write()?;
        lock(&self.checkpoints).insert(checkpoint.chain_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete_checkpoint(&self, chain_id: &str) -> Result<(), IndexerError> {
        self.check_write()?;
        lock(&self.checkpoints).remove(chain_id);
        Ok(())
    }
}

impl IndexStore for MemoryStore {}

// ─── MemoryCache ──────────────────────────────────────────────────────────────

/// Hit/miss counters for a [`MemoryCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// In-process TTL cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    hits: AtomicU64,
    misses: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a cache outage: every call returns a cache error.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Returns `true` if a live (non-expired) entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries)
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: lock(&self.entries).len(),
        }
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        lock(&self.entries).retain(|_, (_, expires)| *expires > now);
    }

    fn check(&self) -> Result<(), IndexerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IndexerError::Cache("memory cache unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, IndexerError> {
        self.check()?;
        let mut entries = lock(&self.entries);
        let now = Instant::now();
        let live = entries
            .get(key)
            .and_then(|(value, expires)| (*expires > now).then(|| value.clone()));
        match live {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            None => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), IndexerError> {
        self.check()?;
        lock(&self.entries).insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), IndexerError> {
        self.check()?;
        let mut entries = lock(&self.entries);
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TransferKind, TransferLog};

    fn ev(block: u64, tx: &str) -> IndexedEvent {
        TransferLog {
            kind: TransferKind::Token,
            contract: "0xc0ffee0000000000000000000000000000000000".into(),
            from: "0x1".into(),
            to: "0x2".into(),
            discriminator: "100".into(),
            block_number: block,
            block_hash: None,
            tx_hash: tx.into(),
            log_index: 0,
            timestamp: None,
        }
        .into_event(0)
    }

    #[tokio::test]
    async fn insert_ignores_duplicate_keys() {
        let store = MemoryStore::new();
        let a = ev(100, "0xa");
        assert_eq!(store.insert_events(&[a.clone(), a.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_events(&[a]).await.unwrap(), 0);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn failed_write_inserts_nothing() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        assert!(store.insert_events(&[ev(1, "0xa")]).await.is_err());
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn rollback_clears_events_markers_and_hashes_from_block() {
        let store = MemoryStore::new();
        for i in 100u64..=105 {
            let e = ev(i, &format!("0x{i}"));
            store
                .insert_marker(&ProcessedEventMarker::new(e.event_key.clone(), i))
                .await
                .unwrap();
            store.insert_events(&[e]).await.unwrap();
            store.record_block_hash("1", i, &format!("0xh{i}")).await.unwrap();
        }

        let outcome = store.rollback_from("1", 103).await.unwrap();
        assert_eq!(outcome.events_removed, 3);
        assert_eq!(outcome.markers_removed, 3);
        assert_eq!(store.event_count(), 3); // 100, 101, 102 remain
        assert!(store.block_hash("1", 103).await.unwrap().is_none());
        assert!(store.block_hash("1", 102).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_and_latest_block() {
        let store = MemoryStore::new();
        store.insert_events(&[ev(5, "0xa"), ev(9, "0xb")]).await.unwrap();
        let stats = store.event_stats().await.unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.contracts, 1);
        assert_eq!(stats.latest_block, Some(9));
        assert_eq!(store.latest_event_block().await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn cache_expires_entries() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::from_millis(20)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.unwrap().is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_entries() {
        let cache = MemoryCache::new();
        cache.set("short", "a".into(), Duration::from_millis(10)).await.unwrap();
        cache.set("long", "b".into(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.purge_expired();
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.contains("long"));
        assert!(!cache.contains("short"));
    }

    #[tokio::test]
    async fn unavailable_cache_errors() {
        let cache = MemoryCache::new();
        cache.set_unavailable(true);
        assert!(cache.get("k").await.is_err());
        assert!(cache.set("k", "v".into(), Duration::from_secs(1)).await.is_err());
    }
}
