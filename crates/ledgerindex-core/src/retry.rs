//! Exponential backoff retry policy with jitter.
//!
//! One policy object is applied at every boundary to an external collaborator:
//! chain RPC calls, batch flushes, and subscription re-establishment.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds (caps exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Add ±`jitter_fraction * backoff` random jitter (0.0 = no jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.config.max_retries {
            return None;
        }
        Some(self.backoff(attempt))
    }

    /// Backoff for the `attempt`-th retry ignoring `max_retries`.
    ///
    /// Used where giving up is not an option (re-subscribing a lost stream).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);

        let jitter_ms = if self.config.jitter_fraction > 0.0 {
            capped * self.config.jitter_fraction * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter_ms).max(0.0) as u64)
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// retries are exhausted. Sleeping between attempts observes `cancel`.
    pub async fn retry<T, F, Fut>(
        &self,
        what: &str,
        cancel: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match self.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            what,
                            "retrying"
                        );
                        match cancel {
                            Some(token) => {
                                tokio::select! {
                                    _ = token.cancelled() => return Err(IndexerError::Cancelled),
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                            None => tokio::time::sleep(delay).await,
                        }
                    }
                    None => {
                        tracing::error!(attempt, error = %e, what, "max retries exceeded");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32, initial: u64, max: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: initial,
            max_backoff_ms: max,
            multiplier,
            jitter_fraction: 0.0,
        })
    }

    #[test]
    fn first_retry_delay() {
        let policy = no_jitter(3, 100, 30_000, 2.0);
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = no_jitter(10, 100, 500, 10.0);
        let d5 = policy.next_delay(5).unwrap();
        assert!(d5 <= Duration::from_millis(500), "d5={d5:?} exceeds max");
        assert_eq!(policy.backoff(50), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
        });
        for _ in 0..50 {
            let d = policy.next_delay(1).unwrap().as_millis();
            assert!((900..=1100).contains(&d), "d={d}");
        }
    }

    #[test]
    fn should_retry_boundary() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 2,
            ..Default::default()
        });
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let policy = no_jitter(3, 1, 5, 2.0);
        let calls = AtomicU32::new(0);
        let out = policy
            .retry("test", None, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IndexerError::Rpc("timeout".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_permanent_errors() {
        let policy = no_jitter(3, 1, 5, 2.0);
        let calls = AtomicU32::new(0);
        let err = policy
            .retry("test", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IndexerError::Configuration("bad".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Configuration(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let policy = no_jitter(2, 1, 5, 2.0);
        let calls = AtomicU32::new(0);
        let err = policy
            .retry("test", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IndexerError::Storage("locked".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_observes_cancellation() {
        let policy = no_jitter(5, 60_000, 60_000, 1.0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = policy
            .retry("test", Some(&cancel), || async {
                Err::<(), _>(IndexerError::Rpc("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Cancelled));
    }
}
