use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics;

/// Jittered exponential backoff around a fallible async operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Seconds before the first retry.
    pub base_delay: f64,
    /// Upper bound on any single (unjittered) delay, in seconds.
    pub max_delay: f64,
    pub exponential_base: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

/// Longest single delay the schedule will produce.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Seconds to a `Duration`, clamped to `[0, MAX_RETRY_DELAY]`. NaN maps to zero.
fn clamped_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs)
        .map(|d| d.min(MAX_RETRY_DELAY))
        .unwrap_or(MAX_RETRY_DELAY)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: base_delay.as_secs_f64(),
            max_delay: max_delay.as_secs_f64(),
            ..Self::default()
        }
    }

    /// Unjittered delay before retry number `attempt` (0-based):
    /// `min(base * exponential_base^attempt, max_delay)`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay * self.exponential_base.powi(attempt as i32);
        clamped_secs(delay.min(self.max_delay))
    }

    /// A fresh backoff schedule. With jitter each delay is scaled by a
    /// uniform factor in `[0.5, 1.5)`.
    pub fn backoff(&self) -> ExponentialBackoff {
        let initial = clamped_secs(self.base_delay);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: if self.jitter { 0.5 } else { 0.0 },
            multiplier: self.exponential_base,
            max_interval: clamped_secs(self.max_delay),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Retries every error.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_if(operation, |_| true).await
    }

    /// Retries only errors accepted by `retryable`; anything else is returned
    /// at once without consuming a retry. At most `max_retries + 1` calls
    /// are made and the last error is returned.
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        retryable: P,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0u32;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !retryable(&e) => return Err(e),
                Err(e) if attempt >= self.max_retries => {
                    warn!(attempts = attempt + 1, error = %e, "Giving up after retries");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.base_delay_for(attempt));
                    warn!(
                        attempt = attempt + 1,
                        ?delay,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    metrics::record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: 0.001,
            max_delay: 0.004,
            exponential_base: 2.0,
            jitter: true,
        }
    }

    #[tokio::test]
    async fn test_always_failing_called_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), String> = fast_policy(3)
            .execute(|attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure {attempt}"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err(), "failure 3");
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let result: Result<u32, String> = fast_policy(3)
            .execute(|attempt| async move {
                if attempt < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_propagate_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), &str> = fast_policy(5)
            .execute_if(
                |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("fatal")
                    }
                },
                |e| *e != "fatal",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: 1.0,
            max_delay: 3.0,
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(policy.base_delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay_for(2), Duration::from_secs(3));
        assert_eq!(policy.base_delay_for(3), Duration::from_secs(3));

        let mut backoff = policy.backoff();
        let schedule: Vec<Duration> = (0..4).filter_map(|_| backoff.next_backoff()).collect();
        assert_eq!(
            schedule,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3)
            ]
        );
    }

    #[test]
    fn test_huge_delays_are_clamped() {
        let policy = RetryPolicy {
            max_retries: 200,
            base_delay: 1e30,
            max_delay: 1e30,
            exponential_base: 10.0,
            jitter: false,
        };
        assert_eq!(policy.base_delay_for(0), MAX_RETRY_DELAY);
        assert_eq!(policy.base_delay_for(150), MAX_RETRY_DELAY);
        let first = policy.backoff().next_backoff().unwrap();
        assert!(first >= MAX_RETRY_DELAY);
        assert!(first <= MAX_RETRY_DELAY + Duration::from_millis(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let mut backoff = policy.backoff();
            let first = backoff.next_backoff().unwrap();
            assert!(first >= Duration::from_millis(500));
            assert!(first <= Duration::from_millis(1501));
        }
    }
}
