//! Bounded retries with exponential backoff and jitter.
//!
//! Transient failures (rate limits, timeouts, 5xx) are retried inside
//! the drivers; permanent failures escape on the first attempt. Jitter
//! spreads retries from concurrent branches so they do not hammer a
//! recovering provider in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::{DriverError, Result};

/// Exponential backoff policy for driver calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Ceiling on any single delay.
    pub max_interval: Duration,
    /// Randomize each delay in `[0.5, 1.5)` of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom attempt bound and defaults elsewhere.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Nominal delay before retry number `attempt` (0-based), jittered.
    pub fn delay(&self, attempt: usize) -> Duration {
        let nominal =
            self.initial_interval.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = nominal.min(self.max_interval.as_secs_f64());
        let jittered = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    /// Run `op` with this policy, retrying retryable failures.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient driver failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_millis(100),
            backoff_factor: 10.0,
            max_interval: Duration::from_secs(1),
            jitter: false,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_interval: Duration::from_millis(1),
            jitter: false,
        };
        let calls = AtomicUsize::new(0);

        let result = policy
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DriverError::Timeout("slow".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_escapes_immediately() {
        let policy = RetryPolicy::new(5);
        let calls = AtomicUsize::new(0);

        let result: Result<()> = policy
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DriverError::InvalidRequest("no".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
