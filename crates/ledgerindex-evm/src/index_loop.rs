//! The indexing orchestrator: wires the pipeline together.
//!
//! # Start
//! Validate the contract list, catch up from the checkpoint to the chain head
//! in checkpointed sub-ranges, then subscribe live from `head + 1` so no block
//! falls between the two phases.
//!
//! # Live
//! One subscription per transfer kind. Every delivered log is dispatched on
//! its own task (bounded by `max_concurrent_workers`):
//!
//! ```text
//! halt check → IdempotencyGate::is_processed → timestamp → BatchWriter::add_event
//!            → cache invalidation → metrics
//! ```
//!
//! A committer task periodically flushes the batch writer and moves the
//! checkpoint to the [`BlockProgress`] watermark, never past a block with an
//! event still in flight or dead-lettered. A lost subscription is
//! re-established with backoff from the last fully delivered block.
//!
//! # Reorgs
//! The reorg monitor runs alongside. Around a rollback, live ingestion is
//! stopped and drained, then restarted from the safe block once the store and
//! checkpoint have been rewound.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use ledgerindex_core::batch::{BatchWriter, DeadLetter, FlushListener, FlushOutcome};
use ledgerindex_core::cache::{Cache, CacheAside};
use ledgerindex_core::checkpoint::{CheckpointManager, CheckpointStore};
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::idempotency::IdempotencyGate;
use ledgerindex_core::indexer::{IndexerConfig, IndexerState};
use ledgerindex_core::metrics::{Metrics, MetricsSnapshot};
use ledgerindex_core::progress::BlockProgress;
use ledgerindex_core::query::EventReader;
use ledgerindex_core::reorg::{HaltSignal, ReorgEvent, ReorgMonitor, RollbackHook};
use ledgerindex_core::retry::RetryPolicy;
use ledgerindex_core::source::{ChainSource, LogSubscription, SourceEvent};
use ledgerindex_core::store::{EventStore, IndexStore, MarkerStore};
use ledgerindex_core::types::{
    is_valid_address, EventQuery, IndexStats, IndexedEvent, LogFilter, TransferKind, TransferLog,
};

use crate::resume::{RangeProcessor, ResumeManager};

/// Live streams, one per transfer kind.
static STREAMS: [(&str, TransferKind); 2] =
    [("nft", TransferKind::Nft), ("token", TransferKind::Token)];

/// Block timestamps remembered for enrichment.
const TIMESTAMP_MEMO: usize = 1_024;

/// The indexing orchestrator. Cheap to clone; clones share one pipeline.
#[derive(Clone)]
pub struct Indexer {
    inner: Arc<Inner>,
}

struct LiveSet {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    config: IndexerConfig,
    source: Arc<dyn ChainSource>,
    checkpoint: Arc<CheckpointManager>,
    gate: IdempotencyGate,
    batch: BatchWriter,
    reader: EventReader,
    monitor: ReorgMonitor,
    progress: BlockProgress,
    halt: HaltSignal,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    workers: Arc<Semaphore>,
    state: StdMutex<IndexerState>,
    watched: StdMutex<Vec<String>>,
    timestamps: StdMutex<BTreeMap<u64, i64>>,
    live: Mutex<Option<LiveSet>>,
    live_wanted: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancels subscriptions, historical fetches, and replay pauses.
    ingest: CancellationToken,
    /// Cancels the reorg monitor and checkpoint committer.
    background: CancellationToken,
}

impl Indexer {
    /// Build a pipeline over `store`. Must be called inside a Tokio runtime.
    pub fn new<S: IndexStore + 'static>(
        config: IndexerConfig,
        source: Arc<dyn ChainSource>,
        store: Arc<S>,
        cache: Arc<dyn Cache>,
    ) -> Result<Self, IndexerError> {
        config.validate()?;

        let events: Arc<dyn EventStore> = store.clone();
        let markers: Arc<dyn MarkerStore> = store.clone();
        let checkpoints: Arc<dyn CheckpointStore> = store.clone();
        let index: Arc<dyn IndexStore> = store;

        let metrics = Arc::new(Metrics::new()?);
        let aside = CacheAside::new(cache, config.cache.clone(), metrics.clone());
        let reader = EventReader::new(events.clone(), aside.clone());
        let gate = IdempotencyGate::new(markers, aside, metrics.clone());
        let checkpoint = Arc::new(CheckpointManager::new(checkpoints, config.chain_id.clone()));
        let retry = RetryPolicy::new(config.retry.clone());
        let halt = HaltSignal::new();

        let listener = Arc::new(PostFlush {
            gate: gate.clone(),
            reader: reader.clone(),
        });
        let batch = BatchWriter::spawn(
            events,
            config.batch.clone(),
            retry.clone(),
            Some(listener),
            metrics.clone(),
        );

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let monitor = ReorgMonitor::new(
                config.reorg.clone(),
                source.clone(),
                index,
                checkpoint.clone(),
                reader.clone(),
                gate.clone(),
                halt.clone(),
                metrics.clone(),
            )
            .with_hook(Arc::new(LiveHook {
                inner: weak.clone(),
            }));

            Inner {
                workers: Arc::new(Semaphore::new(config.max_concurrent_workers)),
                watched: StdMutex::new(config.addresses.clone()),
                config,
                source,
                checkpoint,
                gate,
                batch,
                reader,
                monitor,
                progress: BlockProgress::new(),
                halt,
                metrics,
                retry,
                state: StdMutex::new(IndexerState::Idle),
                timestamps: StdMutex::new(BTreeMap::new()),
                live: Mutex::new(None),
                live_wanted: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                ingest: CancellationToken::new(),
                background: CancellationToken::new(),
            }
        });

        Ok(Self { inner })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> IndexerState {
        *self.inner.lock_state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Pipeline metrics in the Prometheus text exposition format.
    pub fn metrics_text(&self) -> Result<String, IndexerError> {
        self.inner.metrics.encode_text()
    }

    /// Reason the pipeline is halted, if it is.
    pub fn halt_reason(&self) -> Option<String> {
        self.inner.halt.reason()
    }

    /// Contracts the live subscription and `replay_events` cover.
    pub fn watched_addresses(&self) -> Vec<String> {
        self.inner.watched()
    }

    /// Remove and return batches that could not be persisted.
    pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.batch.take_dead_letters()
    }

    // ─── Ingestion ────────────────────────────────────────────────────────

    /// Resume from the checkpoint, then follow the chain live.
    ///
    /// `addresses` replaces the configured contract list when non-empty.
    pub async fn start_indexing(&self, addresses: &[String]) -> Result<(), IndexerError> {
        let inner = &self.inner;
        let addresses = if addresses.is_empty() {
            inner.watched()
        } else {
            addresses.to_vec()
        };
        validate_addresses(&addresses)?;
        inner.halt.check()?;

        {
            let mut state = inner.lock_state();
            match *state {
                IndexerState::Idle => *state = IndexerState::Backfilling,
                IndexerState::Stopping | IndexerState::Stopped => {
                    return Err(IndexerError::ShuttingDown)
                }
                other => {
                    return Err(IndexerError::Configuration(format!(
                        "indexer already started (state: {other})"
                    )))
                }
            }
        }

        *inner.lock_watched() = addresses.clone();
        tracing::info!(
            chain = %inner.config.chain_id,
            contracts = addresses.len(),
            "Starting indexer"
        );

        let live_from = match inner.resume_manager().resume_from_last_block(&addresses).await {
            Ok(block) => block,
            Err(e) => {
                inner.set_state(if e.is_fatal() {
                    IndexerState::Halted
                } else {
                    IndexerState::Idle
                });
                return Err(e);
            }
        };

        inner.live_wanted.store(true, Ordering::SeqCst);
        inner.start_live(live_from).await;
        inner.spawn_background().await;
        inner.set_state(IndexerState::Live);
        tracing::info!(from = live_from, "Live indexing started");
        Ok(())
    }

    /// Fetch and persist every transfer of `addresses` in `[from, to]`.
    ///
    /// Each contract and transfer kind is an independent task; one task's
    /// failure does not stop the others, and all failures are reported
    /// together as [`IndexerError::Historical`]. The checkpoint is not moved.
    pub async fn process_historical_events(
        &self,
        addresses: &[String],
        from: u64,
        to: u64,
    ) -> Result<(), IndexerError> {
        validate_addresses(addresses)?;
        check_range(from, to)?;
        self.inner.halt.check()?;

        let tasks = addresses.iter().flat_map(|address| {
            STREAMS.iter().map(move |&(name, kind)| async move {
                let filter = LogFilter::new(vec![address.clone()], kind);
                self.inner
                    .process_filter(&filter, from, to)
                    .await
                    .map_err(|e| format!("{address} {name}: {e}"))
            })
        });
        let mut failures: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        match self.inner.batch.flush().await {
            Ok(outcome) if outcome.dead_lettered > 0 => failures.push(format!(
                "{} event(s) could not be persisted",
                outcome.dead_lettered
            )),
            Ok(_) => {}
            Err(e) => failures.push(format!("flush: {e}")),
        }

        if failures.is_empty() {
            tracing::info!(from, to, contracts = addresses.len(), "Historical processing complete");
            Ok(())
        } else {
            tracing::error!(from, to, failed = failures.len(), "Historical processing failed");
            Err(IndexerError::Historical { failures })
        }
    }

    /// Re-process `[from, to]` for the watched contracts, checkpointing each
    /// completed sub-range.
    pub async fn replay_events(&self, from: u64, to: u64) -> Result<(), IndexerError> {
        let addresses = self.inner.watched();
        if addresses.is_empty() {
            return Err(IndexerError::Configuration(
                "no contract addresses to replay".into(),
            ));
        }
        self.inner
            .resume_manager()
            .replay_events(from, to, &addresses)
            .await
    }

    /// Run one reorg check against the current head.
    pub async fn check_reorg(&self) -> Result<Option<ReorgEvent>, IndexerError> {
        let inner = &self.inner;
        let head = inner
            .retry
            .retry("current block number", Some(&inner.ingest), || {
                inner.source.current_block_number()
            })
            .await?;
        let result = inner.monitor.detect_and_handle_reorg(head).await;
        if matches!(&result, Err(e) if e.is_fatal()) {
            inner.set_state(IndexerState::Halted);
        }
        result
    }

    /// Operator action after a failed rollback has been resolved: clear the
    /// halt and, if live indexing was running, restart it from the checkpoint.
    pub async fn clear_halt(&self) -> Result<(), IndexerError> {
        let inner = &self.inner;
        inner.halt.clear();
        tracing::warn!(chain = %inner.config.chain_id, "Halt cleared by operator");

        if !inner.live_wanted.load(Ordering::SeqCst) {
            if self.state() == IndexerState::Halted {
                inner.set_state(IndexerState::Idle);
            }
            return Ok(());
        }

        inner.stop_live().await;
        inner.wait_idle().await;
        let from = match inner.checkpoint.load().await? {
            Some(cp) => cp.block_number + 1,
            None => inner.config.start_block,
        };
        inner.progress.rewind(from);
        inner.batch.release_dead_letters_from(from);
        inner.start_live(from).await;
        inner.set_state(IndexerState::Live);
        Ok(())
    }

    /// Graceful shutdown: stop subscriptions, wait for in-flight events,
    /// drain the batch writer, stop the reorg monitor, close the source.
    pub async fn shutdown(&self) -> Result<(), IndexerError> {
        let inner = &self.inner;
        if self.state() == IndexerState::Stopped {
            return Ok(());
        }
        inner.set_state(IndexerState::Stopping);
        inner.live_wanted.store(false, Ordering::SeqCst);
        tracing::info!("Shutting down indexer");

        inner.ingest.cancel();
        inner.stop_live().await;
        inner.wait_idle().await;

        if let Err(e) = inner.commit_progress().await {
            tracing::warn!(error = %e, "final checkpoint commit failed");
        }
        let closed = inner.batch.close().await;

        inner.background.cancel();
        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        inner.source.close().await;
        inner.set_state(IndexerState::Stopped);
        tracing::info!("Indexer stopped");
        closed
    }

    // ─── Reads ────────────────────────────────────────────────────────────

    pub async fn get_events(&self, query: &EventQuery) -> Result<Vec<IndexedEvent>, IndexerError> {
        self.inner.reader.get_events(query).await
    }

    /// `Ok(None)` means no event with this transaction hash is indexed.
    pub async fn get_event_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> Result<Option<IndexedEvent>, IndexerError> {
        self.inner.reader.get_event_by_tx_hash(tx_hash).await
    }

    pub async fn get_events_by_block_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<IndexedEvent>, IndexerError> {
        self.inner.reader.get_events_by_block_range(from, to).await
    }

    pub async fn get_events_by_block_number(
        &self,
        block_number: u64,
    ) -> Result<Vec<IndexedEvent>, IndexerError> {
        self.inner.reader.get_events_by_block_number(block_number).await
    }

    /// Highest block with an indexed event.
    pub async fn get_latest_indexed_block(&self) -> Result<Option<u64>, IndexerError> {
        self.inner.reader.get_latest_indexed_block().await
    }

    pub async fn get_stats(&self) -> Result<IndexStats, IndexerError> {
        self.inner.reader.get_stats().await
    }

    /// The checkpoint; 0 when none has been written.
    pub async fn get_last_processed_block(&self) -> Result<u64, IndexerError> {
        self.inner.checkpoint.last_processed_block().await
    }
}

// ─── Pipeline internals ───────────────────────────────────────────────────────

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, IndexerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: IndexerState) {
        let mut current = self.lock_state();
        if *current != state {
            tracing::debug!(from = %*current, to = %state, "indexer state");
            *current = state;
        }
    }

    fn lock_watched(&self) -> MutexGuard<'_, Vec<String>> {
        self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn watched(&self) -> Vec<String> {
        self.lock_watched().clone()
    }

    fn resume_manager(self: &Arc<Self>) -> ResumeManager {
        ResumeManager::new(
            self.config.start_block,
            self.config.replay_chunk_size,
            Duration::from_millis(self.config.replay_pause_ms),
            self.checkpoint.clone(),
            self.source.clone(),
            self.clone(),
            self.halt.clone(),
            self.retry.clone(),
            self.ingest.clone(),
        )
    }

    /// Run one event through the pipeline. `Ok(false)` for a known duplicate.
    async fn dispatch(&self, log: TransferLog) -> Result<bool, IndexerError> {
        self.halt.check()?;
        self.metrics.events_received.inc();

        let key = log.event_key();
        if self.gate.is_processed(key.as_str()).await {
            tracing::debug!(key = %key, block = log.block_number, "duplicate event skipped");
            return Ok(false);
        }

        let timestamp = self.resolve_timestamp(&log).await;
        let tx_hash = log.tx_hash.clone();
        self.batch.add_event(log.into_event(timestamp)).await?;
        self.reader.invalidate_tx(&tx_hash).await;
        self.metrics.events_enqueued.inc();
        Ok(true)
    }

    /// The log's own timestamp, else its block's (by hash, then by number),
    /// else the current time.
    async fn resolve_timestamp(&self, log: &TransferLog) -> i64 {
        if let Some(ts) = log.timestamp {
            return ts;
        }
        if let Some(&ts) = self.lock_timestamps().get(&log.block_number) {
            return ts;
        }

        let mut block = None;
        if let Some(hash) = &log.block_hash {
            block = self
                .retry
                .retry("block by hash", Some(&self.ingest), || self.source.block_by_hash(hash))
                .await
                .unwrap_or_else(|e| {
                    tracing::debug!(block = log.block_number, error = %e, "block by hash failed");
                    None
                });
        }
        if block.is_none() {
            block = self
                .retry
                .retry("block by number", Some(&self.ingest), || {
                    self.source.block_by_number(log.block_number)
                })
                .await
                .unwrap_or_else(|e| {
                    tracing::debug!(block = log.block_number, error = %e, "block by number failed");
                    None
                });
        }

        match block {
            Some(block) => {
                let mut memo = self.lock_timestamps();
                memo.insert(log.block_number, block.timestamp);
                while memo.len() > TIMESTAMP_MEMO {
                    memo.pop_first();
                }
                block.timestamp
            }
            None => {
                tracing::warn!(block = log.block_number, "block timestamp unavailable, using now");
                chrono::Utc::now().timestamp()
            }
        }
    }

    fn lock_timestamps(&self) -> MutexGuard<'_, BTreeMap<u64, i64>> {
        self.timestamps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch `[from, to]` for `filter` in sub-ranges and dispatch every log.
    async fn process_filter(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<usize, IndexerError> {
        let chunk = self.config.replay_chunk_size.max(1);
        let mut enqueued = 0usize;
        let mut cur = from;
        loop {
            self.halt.check()?;
            let end = cur.saturating_add(chunk - 1).min(to);
            let logs = self
                .retry
                .retry("filter logs", Some(&self.ingest), || {
                    self.source.filter_logs(cur, end, filter)
                })
                .await?;
            let fetched = logs.len();

            let results: Vec<Result<bool, IndexerError>> = stream::iter(logs)
                .map(|log| self.dispatch(log))
                .buffer_unordered(self.config.max_concurrent_workers)
                .collect()
                .await;
            for result in results {
                if result? {
                    enqueued += 1;
                }
            }
            tracing::debug!(from = cur, to = end, fetched, "historical range dispatched");

            if end >= to {
                return Ok(enqueued);
            }
            cur = end + 1;
        }
    }

    // ─── Live subscriptions ───────────────────────────────────────────────

    async fn start_live(self: &Arc<Self>, from: u64) {
        let mut live = self.live.lock().await;
        if live.is_some() || self.ingest.is_cancelled() {
            return;
        }
        let addresses = self.watched();
        let cancel = self.ingest.child_token();
        let mut handles = Vec::with_capacity(STREAMS.len());
        for (name, kind) in STREAMS {
            self.progress.register_stream(name, from);
            let filter = LogFilter::new(addresses.clone(), kind);
            handles.push(tokio::spawn(self.clone().supervise(
                name,
                filter,
                from,
                cancel.clone(),
            )));
        }
        *live = Some(LiveSet { cancel, handles });
    }

    /// Cancel the live subscriptions and wait for their supervisors.
    ///
    /// Stream progress is kept so a final commit can still use it.
    async fn stop_live(&self) {
        let set = self.live.lock().await.take();
        if let Some(set) = set {
            set.cancel.cancel();
            for handle in set.handles {
                let _ = handle.await;
            }
        }
    }

    fn forget_streams(&self) {
        for (name, _) in STREAMS {
            self.progress.remove_stream(name);
        }
    }

    /// Wait until no live dispatch task is running.
    async fn wait_idle(&self) {
        let all = self.config.max_concurrent_workers as u32;
        if let Ok(permits) = self.workers.acquire_many(all).await {
            drop(permits);
        }
    }

    /// Keep one subscription alive until `cancel` fires.
    async fn supervise(
        self: Arc<Self>,
        name: &'static str,
        filter: LogFilter,
        start: u64,
        cancel: CancellationToken,
    ) {
        let mut attempt = 0u32;
        loop {
            let from = self
                .progress
                .delivered_through(name)
                .map_or(start, |through| through + 1);

            match self
                .source
                .subscribe_logs(filter.clone().from_block(from), cancel.clone())
                .await
            {
                Ok(subscription) => {
                    tracing::info!(stream = name, from, "Log subscription started");
                    if self.consume(name, subscription, &cancel).await {
                        attempt = 0;
                    }
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!(stream = name, "Log subscription lost");
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!(stream = name, from, error = %e, "Subscribe failed");
                }
            }

            attempt += 1;
            self.metrics.subscription_restarts.inc();
            let delay = self.retry.backoff(attempt);
            tracing::info!(
                stream = name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Re-subscribing"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Drain one subscription. Returns `true` if anything was delivered.
    async fn consume(
        self: &Arc<Self>,
        name: &'static str,
        mut subscription: LogSubscription,
        cancel: &CancellationToken,
    ) -> bool {
        let mut delivered = false;
        let mut errors_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return delivered,
                error = subscription.errors.recv(), if errors_open => match error {
                    Some(e) => tracing::warn!(stream = name, error = %e, "Subscription error"),
                    None => errors_open = false,
                },
                event = subscription.events.recv() => match event {
                    Some(SourceEvent::Log(log)) => {
                        delivered = true;
                        if !self.spawn_dispatch(name, log, cancel).await {
                            return delivered;
                        }
                    }
                    Some(SourceEvent::Scanned(block)) => {
                        delivered = true;
                        self.progress.observe_scanned(name, block);
                    }
                    None => return delivered,
                },
            }
        }
    }

    async fn spawn_dispatch(
        self: &Arc<Self>,
        name: &'static str,
        log: TransferLog,
        cancel: &CancellationToken,
    ) -> bool {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return false,
            permit = self.workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let block = log.block_number;
        self.progress.observe_log(name, block);
        self.progress.begin(block);
        self.metrics.events_inflight.inc();

        let inner = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = inner.dispatch(log).await {
                inner.progress.fail(block);
                if e.is_shutdown() {
                    tracing::debug!(block, error = %e, "event dropped during shutdown");
                } else {
                    tracing::warn!(block, error = %e, "event dispatch failed");
                }
            }
            inner.metrics.events_inflight.dec();
            inner.progress.finish(block);
        });
        true
    }

    // ─── Background tasks ─────────────────────────────────────────────────

    async fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let inner = self.clone();
        let cancel = self.background.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = inner.monitor.run(cancel).await {
                tracing::error!(error = %e, "Ingestion halted");
                inner.set_state(IndexerState::Halted);
            }
        }));

        let inner = self.clone();
        let cancel = self.background.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(inner.config.checkpoint_interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.commit_progress().await {
                            tracing::warn!(error = %e, "checkpoint commit failed");
                        }
                    }
                }
            }
        }));
    }

    /// Flush and move the checkpoint to the live watermark.
    async fn commit_progress(&self) -> Result<(), IndexerError> {
        if self.halt.is_halted() {
            return Ok(());
        }
        let generation = self.checkpoint.generation();
        let Some(mut mark) = self.progress.watermark() else {
            return Ok(());
        };
        let current = self.checkpoint.load().await?.map(|cp| cp.block_number);
        if current.is_some_and(|c| c >= mark) {
            return Ok(());
        }

        self.batch.flush().await?;
        if let Some(floor) = self.batch.lowest_dead_letter_block() {
            match floor.checked_sub(1) {
                Some(cap) => mark = mark.min(cap),
                None => return Ok(()),
            }
        }
        if current.is_some_and(|c| c >= mark) {
            return Ok(());
        }
        if self
            .checkpoint
            .advance_if_generation(generation, mark, None)
            .await?
        {
            tracing::debug!(block = mark, "live progress checkpointed");
        }
        Ok(())
    }
}

#[async_trait]
impl RangeProcessor for Inner {
    async fn process_range(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
    ) -> Result<(), IndexerError> {
        let tasks = STREAMS.iter().map(|&(_, kind)| {
            let filter = LogFilter::new(addresses.to_vec(), kind);
            async move { self.process_filter(&filter, from, to).await }
        });
        for result in futures::future::join_all(tasks).await {
            result?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<FlushOutcome, IndexerError> {
        self.batch.flush().await
    }
}

// ─── Hooks ────────────────────────────────────────────────────────────────────

/// Marks flushed events processed and retires their cache entries.
struct PostFlush {
    gate: IdempotencyGate,
    reader: EventReader,
}

#[async_trait]
impl FlushListener for PostFlush {
    async fn on_flushed(&self, events: &[IndexedEvent]) {
        for event in events {
            if let Err(e) = self
                .gate
                .mark_processed(&event.event_key, event.block_number)
                .await
            {
                tracing::warn!(key = %event.event_key, error = %e, "failed to record processed marker");
            }
        }
        self.reader.invalidate_events(events).await;
    }
}

/// Quiesces live ingestion around a rollback.
struct LiveHook {
    inner: Weak<Inner>,
}

#[async_trait]
impl RollbackHook for LiveHook {
    async fn before_rollback(&self, safe_block: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.set_state(IndexerState::ReorgRecovery);
        inner.stop_live().await;
        inner.forget_streams();
        inner.wait_idle().await;
        if let Err(e) = inner.batch.flush().await {
            tracing::warn!(safe_block, error = %e, "pre-rollback flush failed");
        }
    }

    async fn after_rollback(&self, event: &ReorgEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.lock_timestamps().clear();
        inner.progress.rewind(event.safe_block);
        inner.batch.release_dead_letters_from(event.safe_block);

        if inner.live_wanted.load(Ordering::SeqCst) {
            inner.start_live(event.safe_block).await;
            inner.set_state(IndexerState::Live);
        } else {
            inner.set_state(IndexerState::Idle);
        }
    }
}

fn validate_addresses(addresses: &[String]) -> Result<(), IndexerError> {
    if addresses.is_empty() {
        return Err(IndexerError::Configuration(
            "at least one contract address is required".into(),
        ));
    }
    match addresses.iter().find(|a| !is_valid_address(a)) {
        Some(bad) => Err(IndexerError::Configuration(format!(
            "invalid contract address: {bad}"
        ))),
        None => Ok(()),
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
