//! Bounded retry for artifact publish/fetch.
//!
//! Retries live with the caller, not the store, so the round deadline stays
//! authoritative: no attempt starts and no backoff sleep extends past it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use policy_sync_core::config::{RetryBackoff, SyncConfig};

/// Attempt budget and delay policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: RetryBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// `max_retry_attempts` and `retry_backoff` from the protocol config
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.max_retry_attempts, config.retry_backoff)
    }

    /// Run `op` until it succeeds, the attempts run out, or `deadline` would be crossed.
    ///
    /// Returns the last error on failure.
    pub async fn run<T, E, F, Fut>(&self, what: &str, deadline: Option<Instant>, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(what, attempt, error = %e, "giving up after exhausting retries");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff.delay_for(attempt);
                    if past_deadline(deadline, delay) {
                        tracing::warn!(what, attempt, error = %e, "giving up: retry would pass deadline");
                        return Err(e);
                    }
                    tracing::debug!(what, attempt, error = %e, ?delay, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn past_deadline(deadline: Option<Instant>, delay: Duration) -> bool {
    deadline.is_some_and(|d| Instant::now() + delay >= d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(ms: u64) -> RetryBackoff {
        RetryBackoff::Fixed {
            delay: Duration::from_millis(ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_a_later_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, fixed(100));
        let started = Instant::now();
        let out: Result<u32, String> = policy
            .run("fetch", None, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_exhausted() {
        let policy = RetryPolicy::new(2, fixed(10));
        let out: Result<(), String> = policy
            .run("publish", None, |attempt| async move { Err(format!("boom {attempt}")) })
            .await;
        assert_eq!(out.unwrap_err(), "boom 2");
    }

    #[tokio::test(start_paused = true)]
    async fn stops_before_crossing_deadline() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(10, fixed(400));
        let deadline = Instant::now() + Duration::from_secs(1);
        let out: Result<(), &str> = policy
            .run("fetch", Some(deadline), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("unavailable") }
            })
            .await;
        assert!(out.is_err());
        // attempts at 0, 400 and 800ms; a fourth would start past the deadline
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(Instant::now() < deadline);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, fixed(1)).max_attempts, 1);
    }
}
