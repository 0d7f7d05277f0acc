//! Cached read API over the event store.
//!
//! Single-event lookups use stable keys and are invalidated explicitly.
//! List lookups (filters, ranges, blocks, aggregates) embed a query epoch
//! that is bumped whenever the event table changes, which retires every
//! older list entry at once.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{keys, CacheAside, CacheKind};
use crate::error::IndexerError;
use crate::store::EventStore;
use crate::types::{EventQuery, IndexStats, IndexedEvent};

/// Read side of the pipeline.
#[derive(Clone)]
pub struct EventReader {
    store: Arc<dyn EventStore>,
    cache: CacheAside,
    epoch: Arc<AtomicU64>,
}

impl EventReader {
    pub fn new(store: Arc<dyn EventStore>, cache: CacheAside) -> Self {
        Self {
            store,
            cache,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// First event of a transaction. `Ok(None)` means not found.
    pub async fn get_event_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<IndexedEvent>, IndexerError> {
        self.cache
            .get_or_load(CacheKind::EventByTx, &keys::event_by_tx(tx_hash), || {
                self.store.event_by_tx_hash(tx_hash)
            })
            .await
    }

    /// Filtered, paged event list.
    pub async fn get_events(&self, query: &EventQuery) -> Result<Vec<IndexedEvent>, IndexerError> {
        if let (Some(from), Some(to)) = (query.from_block, query.to_block) {
            check_range(from, to)?;
        }
        let key = keys::event_query(self.epoch(), query);
        self.cache
            .get_or_load(CacheKind::EventQuery, &key, || self.store.query_events(query))
            .await
    }

    /// Events with `from <= block_number <= to`.
    pub async fn get_events_by_block_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<IndexedEvent>, IndexerError> {
        check_range(from, to)?;
        let key = keys::block_range(self.epoch(), from, to);
        self.cache
            .get_or_load(CacheKind::EventsByBlock, &key, || self.store.events_in_range(from, to))
            .await
    }

    pub async fn get_events_by_block_number(
        &self,
        block_number: u64,
    ) -> Result<Vec<IndexedEvent>, IndexerError> {
        let key = keys::block(self.epoch(), block_number);
        self.cache
            .get_or_load(CacheKind::EventsByBlock, &key, || {
                self.store.events_at_block(block_number)
            })
            .await
    }

    /// Highest block with at least one indexed event.
    pub async fn get_latest_indexed_block(&self) -> Result<Option<u64>, IndexerError> {
        let key = keys::latest_block(self.epoch());
        self.cache
            .get_or_load(CacheKind::LatestBlock, &key, || self.store.latest_event_block())
            .await
    }

    pub async fn get_stats(&self) -> Result<IndexStats, IndexerError> {
        let key = keys::stats(self.epoch());
        self.cache
            .get_or_load(CacheKind::Stats, &key, || self.store.event_stats())
            .await
    }

    /// Retire cache entries affected by a change to `events`.
    pub async fn invalidate_events(&self, events: &[IndexedEvent]) {
        if events.is_empty() {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let tx_keys: BTreeSet<String> = events.iter().map(|e| keys::event_by_tx(&e.tx_hash)).collect();
        let tx_keys: Vec<String> = tx_keys.into_iter().collect();
        self.cache.invalidate(&tx_keys).await;
    }

    /// Drop the cached single-event entry for one transaction.
    pub async fn invalidate_tx(&self, tx_hash: &str) {
        self.cache.invalidate(&[keys::event_by_tx(tx_hash)]).await;
    }
}

fn check_range(from: u64, to: u64) -> Result<(), IndexerError> {
    if from > to {
        return Err(IndexerError::Configuration(format!(
            "invalid block range: from {from} > to {to}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTtlConfig;
    use crate::memory::{MemoryCache, MemoryStore};
    use crate::metrics::Metrics;
    use crate::types::{TransferKind, TransferLog};
    use std::time::Duration;

    fn ev(block: u64, tx: &str) -> IndexedEvent {
        TransferLog {
            kind: TransferKind::Nft,
            contract: "0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d".into(),
            from: "0x1".into(),
            to: "0x2".into(),
            discriminator: format!("0x{block:x}"),
            block_number: block,
            block_hash: None,
            tx_hash: tx.into(),
            log_index: 0,
            timestamp: None,
        }
        .into_event(0)
    }

    fn reader() -> (EventReader, Arc<MemoryStore>, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let aside = CacheAside::new(cache.clone(), CacheTtlConfig::default(), Arc::new(Metrics::new().unwrap()));
        (EventReader::new(store.clone(), aside), store, cache)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn tx_lookup_distinguishes_not_found_from_error() {
        let (reader, store, _) = reader();
        assert!(reader.get_event_by_tx_hash("0xmissing").await.unwrap().is_none());
        store.fail_reads(true);
        assert!(reader.get_event_by_tx_hash("0xmissing").await.is_err());
    }

    #[tokio::test]
    async fn tx_lookup_is_cached_and_invalidated() {
        let (reader, store, cache) = reader();
        let e = ev(10, "0xaa");
        store.insert_events(&[e.clone()]).await.unwrap();

        assert_eq!(reader.get_event_by_tx_hash("0xaa").await.unwrap(), Some(e.clone()));
        settle().await;
        assert!(cache.contains(&keys::event_by_tx("0xaa")));

        // A cache hit never touches the store.
        store.fail_reads(true);
        assert!(reader.get_event_by_tx_hash("0xaa").await.is_ok());

        reader.invalidate_events(&[e]).await;
        assert!(!cache.contains(&keys::event_by_tx("0xaa")));
        assert!(reader.get_event_by_tx_hash("0xaa").await.is_err());
    }

    #[tokio::test]
    async fn list_entries_retire_on_epoch_bump() {
        let (reader, store, _) = reader();
        store.insert_events(&[ev(10, "0x1")]).await.unwrap();
        assert_eq!(reader.get_events_by_block_range(0, 100).await.unwrap().len(), 1);
        settle().await;

        let late = ev(11, "0x2");
        store.insert_events(&[late.clone()]).await.unwrap();
        // Stale until invalidated.
        assert_eq!(reader.get_events_by_block_range(0, 100).await.unwrap().len(), 1);

        reader.invalidate_events(&[late]).await;
        assert_eq!(reader.get_events_by_block_range(0, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_inverted_ranges() {
        let (reader, _, _) = reader();
        assert!(matches!(
            reader.get_events_by_block_range(10, 5).await,
            Err(IndexerError::Configuration(_))
        ));
        let q = EventQuery {
            from_block: Some(9),
            to_block: Some(1),
            ..Default::default()
        };
        assert!(reader.get_events(&q).await.is_err());
    }

    #[tokio::test]
    async fn block_and_stats_reads() {
        let (reader, store, _) = reader();
        store.insert_events(&[ev(7, "0x1"), ev(7, "0x2"), ev(9, "0x3")]).await.unwrap();
        assert_eq!(reader.get_events_by_block_number(7).await.unwrap().len(), 2);
        assert_eq!(reader.get_latest_indexed_block().await.unwrap(), Some(9));
        let stats = reader.get_stats().await.unwrap();
        assert_eq!(stats.total_events, 3);

        let q = EventQuery {
            kind: Some(TransferKind::Nft),
            limit: 2,
            ..Default::default()
        };
        assert_eq!(reader.get_events(&q).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cache_outage_reads_store() {
        let (reader, store, cache) = reader();
        store.insert_events(&[ev(3, "0x1")]).await.unwrap();
        cache.set_unavailable(true);
        assert_eq!(reader.get_events_by_block_number(3).await.unwrap().len(), 1);
    }
}
