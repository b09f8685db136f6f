//! Bounded retry with exponential backoff and jitter.
//!
//! One policy value is shared by the reply generator (provider calls) and both
//! delivery sinks. Retries never cross component boundaries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::Retryable;

/// Retry policy: attempt cap, backoff shape and jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.base_delay_ms)),
            jitter: settings.jitter,
        }
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Attempts actually made.
    pub attempts: u32,
    /// The error from the last attempt.
    pub error: E,
}

impl RetryPolicy {
    /// A policy that never sleeps. Handy for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Deterministic delay after `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let scaled = self.base_delay.saturating_mul(1_u32 << shift);
        scaled.min(self.max_delay)
    }

    /// Delay after `attempt` failed, with jitter in [50%, 100%] of the backoff
    /// and never below a server-requested `retry_after`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.backoff(attempt);
        let delay = if self.jitter && base > Duration::from_millis(1) {
            let high = base.as_millis() as u64;
            let low = high / 2;
            Duration::from_millis(rand::thread_rng().gen_range(low..=high))
        } else {
            base
        };
        match retry_after {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<(T, u32), RetryFailure<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Succeeded after retry");
                    }
                    return Ok((value, attempt));
                }
                Err(error) if !error.is_transient() => {
                    warn!(label, attempt, error = %error, "Permanent failure, not retrying");
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }
                Err(error) if attempt >= max_attempts => {
                    warn!(label, attempt, error = %error, "Retries exhausted");
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }
                Err(error) => {
                    let delay = self.delay_for(attempt, error.retry_after());
                    warn!(
                        label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Flaky {
        transient: bool,
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.transient)
        }
    }

    impl Retryable for Flaky {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(1000),
            jitter: false,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        let base = policy.backoff(3);
        for _ in 0..64 {
            let delay = policy.delay_for(3, None);
            assert!(delay >= base / 2, "{delay:?} below half of {base:?}");
            assert!(delay <= base, "{delay:?} above {base:?}");
        }
    }

    #[test]
    fn retry_after_raises_the_floor() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(10))),
            Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn transient_failures_use_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(4);
        let result: Result<((), u32), _> = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky { transient: true }) }
            })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let result: Result<((), u32), _> = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky { transient: false }) }
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_transient_reports_attempt() {
        let policy = RetryPolicy::immediate(3);
        let result = policy
            .run("test", |attempt| async move {
                if attempt < 2 {
                    Err(Flaky { transient: true })
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(result, ("done", 2));
    }
}
