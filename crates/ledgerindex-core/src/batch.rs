//! Batch persistence engine.
//!
//! Producers call [`BatchWriter::add_event`], which pushes onto a bounded
//! channel (`batch_size * buffer_factor` slots) and waits when it is full.
//! A background task owns the buffer and flushes it when the first of these
//! fires:
//!
//! 1. the buffer reaches `batch_size`
//! 2. the flush interval ticks with at least one pending record
//! 3. an explicit [`BatchWriter::flush`] request arrives
//! 4. [`BatchWriter::close`] is called (final drain)
//!
//! Each flush is one insert-or-ignore transaction per `batch_size` chunk.
//! A chunk that still fails after the retry policy is exhausted goes to a
//! bounded dead-letter queue; it is never silently dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::store::EventStore;
use crate::types::IndexedEvent;

/// Batch writer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Records per bulk insert.
    pub batch_size: usize,
    /// Partial batches are flushed at this interval (milliseconds).
    pub flush_timeout_ms: u64,
    /// Channel capacity is `batch_size * buffer_factor`.
    pub buffer_factor: usize,
    /// Maximum number of failed batches kept for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_timeout_ms: 5_000,
            buffer_factor: 10,
            dead_letter_capacity: 1_000,
        }
    }
}

impl BatchConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn channel_capacity(&self) -> usize {
        self.batch_size.saturating_mul(self.buffer_factor).max(1)
    }
}

/// Called after a chunk has been durably committed.
#[async_trait]
pub trait FlushListener: Send + Sync {
    async fn on_flushed(&self, events: &[IndexedEvent]);
}

/// A batch that could not be written.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub events: Vec<IndexedEvent>,
    pub error: String,
    pub failed_at: i64,
}

/// Result of a flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Records committed (including rows ignored as duplicates).
    pub written: usize,
    /// Records moved to the dead-letter queue.
    pub dead_lettered: usize,
}

impl FlushOutcome {
    fn merge(&mut self, other: FlushOutcome) {
        self.written += other.written;
        self.dead_lettered += other.dead_lettered;
    }
}

type DeadLetters = Arc<StdMutex<VecDeque<DeadLetter>>>;

/// No dead-lettered block yet.
const NO_FLOOR: u64 = u64::MAX;

/// Buffers records and writes them in bulk.
pub struct BatchWriter {
    tx: mpsc::Sender<IndexedEvent>,
    flush_tx: mpsc::Sender<oneshot::Sender<FlushOutcome>>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    dead_letters: DeadLetters,
    /// Lowest block ever dead-lettered; survives queue eviction and `take_dead_letters`.
    dead_floor: Arc<AtomicU64>,
}

impl BatchWriter {
    /// Spawn the background flush task.
    pub fn spawn(
        store: Arc<dyn EventStore>,
        config: BatchConfig,
        retry: RetryPolicy,
        listener: Option<Arc<dyn FlushListener>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity());
        let (flush_tx, flush_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let dead_letters: DeadLetters = Arc::new(StdMutex::new(VecDeque::new()));
        let dead_floor = Arc::new(AtomicU64::new(NO_FLOOR));

        let worker = FlushWorker {
            store,
            config,
            retry,
            listener,
            metrics,
            dead_letters: dead_letters.clone(),
            dead_floor: dead_floor.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, flush_rx, shutdown.clone()));

        Self {
            tx,
            flush_tx,
            shutdown,
            handle: Mutex::new(Some(handle)),
            dead_letters,
            dead_floor,
        }
    }

    /// Enqueue a record, waiting for space when the buffer is full.
    ///
    /// Fails with [`IndexerError::ShuttingDown`] once `close` has been called.
    pub async fn add_event(&self, event: IndexedEvent) -> Result<(), IndexerError> {
        if self.shutdown.is_cancelled() {
            return Err(IndexerError::ShuttingDown);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(IndexerError::ShuttingDown),
            sent = self.tx.send(event) => sent.map_err(|_| IndexerError::ShuttingDown),
        }
    }

    /// Flush everything enqueued so far and wait for the write to finish.
    pub async fn flush(&self) -> Result<FlushOutcome, IndexerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.flush_tx
            .send(ack_tx)
            .await
            .map_err(|_| IndexerError::ShuttingDown)?;
        ack_rx.await.map_err(|_| IndexerError::ShuttingDown)
    }

    /// Records waiting in the channel (not yet picked up by the flush task).
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Remove and return every dead-lettered batch.
    pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
        let mut dl = self
            .dead_letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        dl.drain(..).collect()
    }

    /// Lowest block number of any record that was dead-lettered.
    ///
    /// Progress past this block is not durable, so checkpoints must stay below it.
    pub fn lowest_dead_letter_block(&self) -> Option<u64> {
        match self.dead_floor.load(Ordering::SeqCst) {
            NO_FLOOR => None,
            block => Some(block),
        }
    }

    /// Forget dead-lettered blocks at or above `block` (they are being re-derived).
    pub fn release_dead_letters_from(&self, block: u64) {
        let _ = self
            .dead_floor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |floor| {
                (floor != NO_FLOOR && floor >= block).then_some(NO_FLOOR)
            });
    }

    /// Stop accepting records, drain the buffer, and wait for the final flush.
    pub async fn close(&self) -> Result<(), IndexerError> {
        self.shutdown.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| IndexerError::Other(format!("batch flush task failed: {e}")))?;
        }
        Ok(())
    }
}

// ─── Flush task ───────────────────────────────────────────────────────────────

struct FlushWorker {
    store: Arc<dyn EventStore>,
    config: BatchConfig,
    retry: RetryPolicy,
    listener: Option<Arc<dyn FlushListener>>,
    metrics: Arc<Metrics>,
    dead_letters: DeadLetters,
    dead_floor: Arc<AtomicU64>,
}

impl FlushWorker {
    async fn run(
        self,
        mut rx: mpsc::Receiver<IndexedEvent>,
        mut flush_rx: mpsc::Receiver<oneshot::Sender<FlushOutcome>>,
        shutdown: CancellationToken,
    ) {
        let batch_size = self.config.batch_size.max(1);
        let mut buffer: Vec<IndexedEvent> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(self.config.flush_timeout());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Some(event) = rx.recv().await {
                        buffer.push(event);
                    }
                    let outcome = self.flush(&mut buffer).await;
                    flush_rx.close();
                    while let Some(ack) = flush_rx.recv().await {
                        let _ = ack.send(FlushOutcome::default());
                    }
                    tracing::info!(
                        written = outcome.written,
                        dead_lettered = outcome.dead_lettered,
                        "batch writer drained"
                    );
                    break;
                }

                Some(ack) = flush_rx.recv() => {
                    while let Ok(event) = rx.try_recv() {
                        buffer.push(event);
                    }
                    let outcome = self.flush(&mut buffer).await;
                    let _ = ack.send(outcome);
                    ticker.reset();
                }

                received = rx.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            self.flush(&mut buffer).await;
                            ticker.reset();
                        }
                    }
                    None => {
                        self.flush(&mut buffer).await;
                        break;
                    }
                },

                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        tracing::debug!(pending = buffer.len(), "flush timeout reached");
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }
    }

    /// Write the buffer in `batch_size` chunks; the buffer is empty afterwards.
    async fn flush(&self, buffer: &mut Vec<IndexedEvent>) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        if buffer.is_empty() {
            return outcome;
        }
        let pending = std::mem::take(buffer);
        for chunk in pending.chunks(self.config.batch_size.max(1)) {
            outcome.merge(self.write_chunk(chunk).await);
        }
        outcome
    }

    async fn write_chunk(&self, chunk: &[IndexedEvent]) -> FlushOutcome {
        let written = self
            .retry
            .retry("batch flush", None, || self.store.insert_events(chunk))
            .await;

        match written {
            Ok(inserted) => {
                self.metrics.batches_flushed.inc();
                self.metrics.events_flushed.inc_by(inserted);
                tracing::debug!(
                    size = chunk.len(),
                    inserted,
                    duplicates = chunk.len() as u64 - inserted.min(chunk.len() as u64),
                    "batch flushed"
                );
                if let Some(listener) = &self.listener {
                    listener.on_flushed(chunk).await;
                }
                FlushOutcome {
                    written: chunk.len(),
                    dead_lettered: 0,
                }
            }
            Err(e) => {
                self.metrics.flush_failures.inc();
                self.metrics.events_dead_lettered.inc_by(chunk.len() as u64);
                tracing::error!(
                    size = chunk.len(),
                    first_block = chunk.first().map(|e| e.block_number),
                    error = %e,
                    "batch flush failed, moved to dead-letter queue"
                );
                self.dead_letter(chunk, &e);
                FlushOutcome {
                    written: 0,
                    dead_lettered: chunk.len(),
                }
            }
        }
    }

    fn dead_letter(&self, chunk: &[IndexedEvent], error: &IndexerError) {
        if let Some(lowest) = chunk.iter().map(|e| e.block_number).min() {
            self.dead_floor.fetch_min(lowest, Ordering::SeqCst);
        }
        let mut dl = self
            .dead_letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if dl.len() >= self.config.dead_letter_capacity.max(1) {
            if let Some(dropped) = dl.pop_front() {
                tracing::error!(
                    size = dropped.events.len(),
                    "dead-letter queue full, discarding oldest batch"
                );
            }
        }
        dl.push_back(DeadLetter {
            events: chunk.to_vec(),
            error: error.to_string(),
            failed_at: chrono::Utc::now().timestamp(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::retry::RetryConfig;
    use crate::types::{TransferKind, TransferLog};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ev(i: u64) -> IndexedEvent {
        TransferLog {
            kind: TransferKind::Token,
            contract: "0xc0ffee0000000000000000000000000000000000".into(),
            from: "0x1".into(),
            to: "0x2".into(),
            discriminator: i.to_string(),
            block_number: i,
            block_hash: None,
            tx_hash: format!("0x{i:x}"),
            log_index: 0,
            timestamp: None,
        }
        .into_event(0)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        })
    }

    fn writer(store: Arc<MemoryStore>, batch_size: usize, timeout_ms: u64) -> BatchWriter {
        BatchWriter::spawn(
            store,
            BatchConfig {
                batch_size,
                flush_timeout_ms: timeout_ms,
                ..Default::default()
            },
            fast_retry(),
            None,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl FlushListener for Counting {
        async fn on_flushed(&self, events: &[IndexedEvent]) {
            self.0.fetch_add(events.len(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn full_batch_flushes_without_waiting_for_timeout() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(store.clone(), 5, 60_000);
        for i in 0..5 {
            w.add_event(ev(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.event_count(), 5);
        assert_eq!(store.insert_calls(), 1);
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn partial_batch_flushes_after_timeout() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(store.clone(), 100, 50);
        for i in 0..3 {
            w.add_event(ev(i)).await.unwrap();
        }
        assert_eq!(store.event_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.event_count(), 3);
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_flush_writes_pending_records() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(store.clone(), 100, 60_000);
        for i in 0..7 {
            w.add_event(ev(i)).await.unwrap();
        }
        let outcome = w.flush().await.unwrap();
        assert_eq!(outcome.written, 7);
        assert_eq!(store.event_count(), 7);
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_drains_then_rejects() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(store.clone(), 100, 60_000);
        for i in 0..42 {
            w.add_event(ev(i)).await.unwrap();
        }
        assert!(!w.is_closed());
        w.close().await.unwrap();
        assert!(w.is_closed());
        assert_eq!(w.queued(), 0);
        assert_eq!(store.event_count(), 42);
        assert!(matches!(
            w.add_event(ev(99)).await,
            Err(IndexerError::ShuttingDown)
        ));
        assert!(w.flush().await.is_err());
    }

    #[tokio::test]
    async fn duplicate_records_write_one_row() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(store.clone(), 10, 60_000);
        w.add_event(ev(1)).await.unwrap();
        w.add_event(ev(1)).await.unwrap();
        w.flush().await.unwrap();
        assert_eq!(store.event_count(), 1);
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_flush_is_dead_lettered_not_dropped() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(store.clone(), 10, 60_000);
        store.fail_writes(true);
        for i in 0..3 {
            w.add_event(ev(i)).await.unwrap();
        }
        let outcome = w.flush().await.unwrap();
        assert_eq!(outcome.dead_lettered, 3);
        assert_eq!(store.event_count(), 0);

        let dead = w.take_dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].events.len(), 3);
        assert!(w.take_dead_letters().is_empty());
        // The floor outlives the queue.
        assert_eq!(w.lowest_dead_letter_block(), Some(0));
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn dead_letter_floor_released_by_rollback() {
        let store = Arc::new(MemoryStore::new());
        let w = writer(store.clone(), 10, 60_000);
        store.fail_writes(true);
        w.add_event(ev(42)).await.unwrap();
        w.add_event(ev(45)).await.unwrap();
        w.flush().await.unwrap();
        assert_eq!(w.lowest_dead_letter_block(), Some(42));

        w.release_dead_letters_from(50);
        assert_eq!(w.lowest_dead_letter_block(), Some(42));
        w.release_dead_letters_from(40);
        assert_eq!(w.lowest_dead_letter_block(), None);
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn listener_sees_only_committed_records() {
        let store = Arc::new(MemoryStore::new());
        let listener = Arc::new(Counting::default());
        let w = BatchWriter::spawn(
            store.clone(),
            BatchConfig {
                batch_size: 4,
                flush_timeout_ms: 60_000,
                ..Default::default()
            },
            fast_retry(),
            Some(listener.clone()),
            Arc::new(Metrics::new().unwrap()),
        );
        for i in 0..4 {
            w.add_event(ev(i)).await.unwrap();
        }
        w.flush().await.unwrap();
        store.fail_writes(true);
        w.add_event(ev(10)).await.unwrap();
        w.flush().await.unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 4);
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn full_buffer_applies_backpressure() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true);
        let w = Arc::new(BatchWriter::spawn(
            store.clone(),
            BatchConfig {
                batch_size: 1,
                flush_timeout_ms: 60_000,
                buffer_factor: 1,
                dead_letter_capacity: 10,
            },
            RetryPolicy::new(RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 300,
                max_backoff_ms: 300,
                multiplier: 1.0,
                jitter_fraction: 0.0,
            }),
            None,
            Arc::new(Metrics::new().unwrap()),
        ));
        // First record is taken by the flush task and stalls in retry,
        // the second fills the single channel slot.
        w.add_event(ev(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        w.add_event(ev(2)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), w.add_event(ev(3))).await;
        assert!(blocked.is_err(), "add_event should wait while the buffer is full");
        w.close().await.unwrap();
    }
}
