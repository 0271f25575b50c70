//! Bounded exponential-backoff retry shared by every worker.
//!
//! The policy only decides *when* to try again. Whether an exhausted
//! operation is fatal is always the caller's decision: the chat collector
//! drops a message, the stats collector skips a tick, a failed connect
//! faults the worker.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;

use crate::config::RetryConfig;
use crate::metrics::{METRICS, RuntimeMetrics};

/// Largest exponent applied to the seed delay; keeps the shift in range.
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

/// Per-invocation bookkeeping, discarded on success or exhaustion.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempt: u32,
    next_delay: Duration,
}

/// Surfaced when every attempt failed. Carries the last underlying error.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub operation: String,
    pub attempts: u32,
    pub last_error: E,
}

impl RetryPolicy {
    /// `max_attempts` of zero is treated as a single attempt.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(cfg.max_attempts, Duration::from_secs(cfg.backoff_secs))
    }

    /// Delay after the given failed attempt (1-based):
    /// `backoff × 2^(attempt − 1)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.backoff.saturating_mul(1u32 << exp)
    }

    /// Runs `op` until it succeeds or `max_attempts` is reached.
    ///
    /// Every failed attempt is logged and counted in
    /// `METRICS.retry_attempts`; the policy performs no other I/O.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut state = RetryState {
            attempt: 0,
            next_delay: self.backoff,
        };

        loop {
            state.attempt += 1;

            match op().await {
                Ok(value) => {
                    if state.attempt > 1 {
                        debug!("{operation} succeeded on attempt {}", state.attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    RuntimeMetrics::incr(&METRICS.retry_attempts);

                    if state.attempt >= self.max_attempts {
                        warn!(
                            "{operation} failed on final attempt {}/{}: {e}",
                            state.attempt, self.max_attempts
                        );
                        return Err(RetryExhausted {
                            operation: operation.to_string(),
                            attempts: state.attempt,
                            last_error: e,
                        });
                    }

                    state.next_delay = self.delay_for(state.attempt);
                    warn!(
                        "{operation} failed (attempt {}/{}): {e} – retry in {:?}",
                        state.attempt, self.max_attempts, state.next_delay
                    );
                    sleep(state.next_delay).await;
                }
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempts: {}",
            self.operation, self.attempts, self.last_error
        )
    }
}

impl<E> Error for RetryExhausted<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn delay_doubles_from_the_seed() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::new(5, Duration::from_secs(u64::MAX / 2));
        assert_eq!(policy.delay_for(u32::MAX), Duration::MAX);
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_exactly_max_attempts() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .run("always fails", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("boom") }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error, "boom");
        assert_eq!(err.to_string(), "always fails failed after 4 attempts: boom");
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_exactly_k_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let value = policy
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if n < 3 { Err("not yet") } else { Ok(n) } }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s after the first failure, 4s after the second
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_does_not_sleep() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10));
        let started = Instant::now();

        let value = policy
            .run("instant", || async { Ok::<_, &str>(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
