//! Prometheus metrics for the indexing pipeline.
//!
//! Every metric is registered on one [`Registry`], either a private one
//! ([`Metrics::new`]) or the host's ([`Metrics::register`]). Names follow
//! `ledgerindex_<metric>_total` for counters.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Shared pipeline metrics.
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,
    pub events_received: IntCounter,
    pub events_enqueued: IntCounter,
    pub duplicates_skipped: IntCounter,
    pub events_flushed: IntCounter,
    pub batches_flushed: IntCounter,
    pub flush_failures: IntCounter,
    pub events_dead_lettered: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_errors: IntCounter,
    pub reorgs_detected: IntCounter,
    pub subscription_restarts: IntCounter,
    /// Live events currently being dispatched.
    pub events_inflight: IntGauge,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_enqueued: u64,
    pub duplicates_skipped: u64,
    pub events_flushed: u64,
    pub batches_flushed: u64,
    pub flush_failures: u64,
    pub events_dead_lettered: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub reorgs_detected: u64,
    pub subscription_restarts: u64,
    pub events_inflight: i64,
}

impl Metrics {
    /// Metrics on a private registry.
    pub fn new() -> Result<Self, IndexerError> {
        Self::register(&Registry::new())
    }

    /// Register every metric on `registry`.
    ///
    /// Fails if the registry already holds a metric with the same name.
    pub fn register(registry: &Registry) -> Result<Self, IndexerError> {
        let counter = |name: &str, help: &str| -> Result<IntCounter, IndexerError> {
            let c = IntCounter::new(format!("ledgerindex_{name}_total"), help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let events_inflight = IntGauge::new(
            "ledgerindex_events_inflight",
            "Live events currently being dispatched",
        )?;
        registry.register(Box::new(events_inflight.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            events_received: counter("events_received", "Events delivered by the chain source")?,
            events_enqueued: counter("events_enqueued", "Events handed to the batch writer")?,
            duplicates_skipped: counter(
                "duplicates_skipped",
                "Events skipped because they were already processed",
            )?,
            events_flushed: counter("events_flushed", "Rows inserted by batch flushes")?,
            batches_flushed: counter("batches_flushed", "Batches committed to the store")?,
            flush_failures: counter(
                "flush_failures",
                "Batches that failed after exhausting retries",
            )?,
            events_dead_lettered: counter(
                "events_dead_lettered",
                "Events moved to the dead-letter queue",
            )?,
            cache_hits: counter("cache_hits", "Cache-aside lookups served from cache")?,
            cache_misses: counter("cache_misses", "Cache-aside lookups that went to the store")?,
            cache_errors: counter("cache_errors", "Cache engine failures")?,
            reorgs_detected: counter("reorgs_detected", "Chain reorganizations detected")?,
            subscription_restarts: counter(
                "subscription_restarts",
                "Live subscriptions re-established after loss",
            )?,
            events_inflight,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.get(),
            events_enqueued: self.events_enqueued.get(),
            duplicates_skipped: self.duplicates_skipped.get(),
            events_flushed: self.events_flushed.get(),
            batches_flushed: self.batches_flushed.get(),
            flush_failures: self.flush_failures.get(),
            events_dead_lettered: self.events_dead_lettered.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_errors: self.cache_errors.get(),
            reorgs_detected: self.reorgs_detected.get(),
            subscription_restarts: self.subscription_restarts.get(),
            events_inflight: self.events_inflight.get(),
        }
    }

    /// Encode the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, IndexerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| IndexerError::Other(format!("metrics encoding: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_registered_counters() {
        let m = Metrics::new().unwrap();
        m.events_received.inc();
        m.events_flushed.inc_by(5);
        m.events_inflight.inc();
        m.events_inflight.inc();
        m.events_inflight.dec();

        let snap = m.snapshot();
        assert_eq!(snap.events_received, 1);
        assert_eq!(snap.events_flushed, 5);
        assert_eq!(snap.events_inflight, 1);
        assert_eq!(snap.reorgs_detected, 0);
    }

    #[test]
    fn shared_registry_exposes_pipeline_metrics() {
        let registry = Registry::new();
        let m = Metrics::register(&registry).unwrap();
        m.reorgs_detected.inc();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"ledgerindex_reorgs_detected_total".to_string()));
        assert!(names.contains(&"ledgerindex_events_inflight".to_string()));

        let text = m.encode_text().unwrap();
        assert!(text.contains("ledgerindex_reorgs_detected_total 1"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        Metrics::register(&registry).unwrap();
        assert!(Metrics::register(&registry).is_err());
    }
}
