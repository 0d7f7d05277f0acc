//! Block progress tracker: decides how far the checkpoint may advance.
//!
//! Live events are dispatched concurrently and out of order, and several
//! streams (one per transfer kind) deliver independently. A block is complete
//! only when every stream has moved past it and no event from it is still in
//! flight. The watermark is therefore
//!
//! ```text
//! min( min over streams of delivered-through,
//!      lowest in-flight block - 1,
//!      lowest failed block - 1 )
//! ```
//!
//! A block whose event failed dispatch stays a ceiling until a rewind moves
//! the streams back below it and the block is delivered again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    /// Stream name → highest block whose logs have all been delivered.
    streams: HashMap<String, Option<u64>>,
    /// Block number → number of events still being dispatched.
    inflight: BTreeMap<u64, usize>,
    /// Lowest block with an event that could not be dispatched.
    failed: Option<u64>,
}

/// Tracks delivery and dispatch progress for the checkpoint.
#[derive(Debug, Default)]
pub struct BlockProgress {
    state: Mutex<State>,
}

impl BlockProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a stream that starts delivering at `start_block`.
    pub fn register_stream(&self, name: &str, start_block: u64) {
        self.lock()
            .streams
            .insert(name.to_string(), start_block.checked_sub(1));
    }

    pub fn remove_stream(&self, name: &str) {
        self.lock().streams.remove(name);
    }

    /// Highest block `name` has fully delivered, if any.
    pub fn delivered_through(&self, name: &str) -> Option<u64> {
        self.lock().streams.get(name).copied().flatten()
    }

    /// A log for `block` arrived on `name`; everything before it is delivered.
    pub fn observe_log(&self, name: &str, block: u64) {
        self.raise(name, block.checked_sub(1));
    }

    /// The stream reported it has delivered everything through `block`.
    pub fn observe_scanned(&self, name: &str, block: u64) {
        self.raise(name, Some(block));
    }

    fn raise(&self, name: &str, through: Option<u64>) {
        let mut state = self.lock();
        if let Some(current) = state.streams.get_mut(name) {
            if through > *current {
                *current = through;
            }
        }
    }

    /// An event from `block` entered dispatch.
    pub fn begin(&self, block: u64) {
        *self.lock().inflight.entry(block).or_insert(0) += 1;
    }

    /// An event from `block` finished dispatch (successfully or not).
    pub fn finish(&self, block: u64) {
        let mut state = self.lock();
        if let Some(count) = state.inflight.get_mut(&block) {
            *count -= 1;
            if *count == 0 {
                state.inflight.remove(&block);
            }
        }
    }

    /// An event from `block` was dropped; hold the watermark below it.
    pub fn fail(&self, block: u64) {
        let mut state = self.lock();
        state.failed = Some(state.failed.map_or(block, |f| f.min(block)));
    }

    /// Number of events currently in dispatch.
    pub fn inflight(&self) -> usize {
        self.lock().inflight.values().sum()
    }

    /// Highest block that is safe to checkpoint, if any.
    pub fn watermark(&self) -> Option<u64> {
        let state = self.lock();
        if state.streams.is_empty() {
            return None;
        }
        let mut mark = state
            .streams
            .values()
            .copied()
            .min()
            .flatten()?;
        if let Some((&lowest, _)) = state.inflight.iter().next() {
            mark = mark.min(lowest.checked_sub(1)?);
        }
        if let Some(failed) = state.failed {
            mark = mark.min(failed.checked_sub(1)?);
        }
        Some(mark)
    }

    /// Move every stream back so nothing at or above `block` counts as delivered.
    pub fn rewind(&self, block: u64) {
        let mut state = self.lock();
        let cap = block.checked_sub(1);
        for through in state.streams.values_mut() {
            if *through > cap {
                *through = cap;
            }
        }
        if state.failed.is_some_and(|f| f >= block) {
            state.failed = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_streams_no_watermark() {
        let p = BlockProgress::new();
        assert_eq!(p.watermark(), None);
    }

    #[test]
    fn slowest_stream_bounds_watermark() {
        let p = BlockProgress::new();
        p.register_stream("nft", 100);
        p.register_stream("token", 100);
        assert_eq!(p.watermark(), Some(99));

        p.observe_scanned("nft", 120);
        p.observe_log("token", 110);
        assert_eq!(p.watermark(), Some(109));

        p.observe_scanned("token", 130);
        assert_eq!(p.watermark(), Some(120));
    }

    #[test]
    fn inflight_events_hold_back_their_block() {
        let p = BlockProgress::new();
        p.register_stream("nft", 0);
        p.observe_scanned("nft", 50);
        p.begin(42);
        p.begin(42);
        p.begin(45);
        assert_eq!(p.watermark(), Some(41));

        p.finish(42);
        assert_eq!(p.watermark(), Some(41));
        p.finish(42);
        assert_eq!(p.watermark(), Some(44));
        p.finish(45);
        assert_eq!(p.watermark(), Some(50));
        assert_eq!(p.inflight(), 0);
    }

    #[test]
    fn stream_starting_at_genesis_has_no_watermark_yet() {
        let p = BlockProgress::new();
        p.register_stream("nft", 0);
        assert_eq!(p.watermark(), None);
        p.observe_log("nft", 0);
        assert_eq!(p.watermark(), None);
        p.observe_log("nft", 1);
        assert_eq!(p.watermark(), Some(0));
    }

    #[test]
    fn failed_block_caps_until_rewound() {
        let p = BlockProgress::new();
        p.register_stream("nft", 10);
        p.observe_scanned("nft", 30);
        p.fail(22);
        p.fail(25);
        assert_eq!(p.watermark(), Some(21));
        assert_eq!(p.delivered_through("nft"), Some(30));

        p.rewind(22);
        assert_eq!(p.watermark(), Some(21));
        p.observe_scanned("nft", 30);
        assert_eq!(p.watermark(), Some(30));
    }

    #[test]
    fn progress_never_regresses_except_by_rewind() {
        let p = BlockProgress::new();
        p.register_stream("token", 10);
        p.observe_scanned("token", 60);
        p.observe_log("token", 20);
        assert_eq!(p.watermark(), Some(60));

        p.rewind(40);
        assert_eq!(p.watermark(), Some(39));
    }
}
