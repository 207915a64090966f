//! Retry utilities for eventually-consistent cloud and cluster state.
//!
//! Two flavours are provided:
//!
//! - [`retry_fixed`] polls at a fixed interval for a bounded number of
//!   attempts, stopping early on errors the caller classifies as terminal.
//!   This is what every "wait until" in the harness uses: instance group
//!   scale-up, Consul membership convergence, leader election.
//! - [`retry_with_backoff`] uses exponential backoff with jitter and is meant
//!   for best-effort calls into external tools that may fail transiently.
//!
//! # Example
//!
//! ```ignore
//! use harness_common::retry::{retry_fixed, PollPolicy};
//!
//! let ip = retry_fixed(&PollPolicy::INSTANCE_BOOT, "instances in group", Error::is_transient, || async {
//!     resolve_once().await
//! })
//! .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{error, warn};

/// Fixed-interval polling budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of attempts (at least one attempt is always made)
    pub max_attempts: u32,
    /// Sleep between consecutive attempts
    pub interval: Duration,
}

impl PollPolicy {
    /// Budget for a managed instance group to get its first member: 30 × 5s.
    pub const INSTANCE_BOOT: PollPolicy = PollPolicy {
        max_attempts: 30,
        interval: Duration::from_secs(5),
    };

    /// Budget for a Consul cluster to converge and elect a leader: 60 × 10s.
    pub const CLUSTER_HEALTH: PollPolicy = PollPolicy {
        max_attempts: 60,
        interval: Duration::from_secs(10),
    };

    /// Create a policy with the given attempt count and interval
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Returned by [`retry_fixed`] when the attempt budget is spent.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("gave up waiting for {description} after {attempts} attempts: {last_error}")]
pub struct Exhausted<E: fmt::Display> {
    /// What was being waited for
    pub description: String,
    /// Number of attempts made
    pub attempts: u32,
    /// Error returned by the final attempt
    pub last_error: E,
}

/// Why a [`retry_fixed`] poll ended without a value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError<E: fmt::Display> {
    /// The attempt budget ran out while the error stayed transient
    #[error("{0}")]
    Exhausted(Exhausted<E>),
    /// An attempt failed in a way further attempts cannot fix
    #[error("{0}")]
    Terminal(E),
}

/// Poll `operation` at a fixed interval until it succeeds or the budget runs out.
///
/// Errors for which `is_transient` returns false end the poll at once. No
/// sleep happens after the final attempt, so the call never blocks longer
/// than [`PollPolicy::ceiling`] plus the time spent inside `operation`.
pub async fn retry_fixed<F, Fut, T, E, P>(
    policy: &PollPolicy,
    description: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_transient(&e) => {
                error!(
                    description = %description,
                    attempt = attempt,
                    error = %e,
                    "Error is not retryable, giving up"
                );
                return Err(PollError::Terminal(e));
            }
            Err(e) if attempt >= max_attempts => {
                error!(
                    description = %description,
                    attempt = attempt,
                    error = %e,
                    "Giving up after max attempts"
                );
                return Err(PollError::Exhausted(Exhausted {
                    description: description.to_string(),
                    attempts: attempt,
                    last_error: e,
                }));
            }
            Err(e) => {
                warn!(
                    description = %description,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    "Condition not met yet, retrying in {:?}",
                    policy.interval
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success or until `max_attempts` is reached (if non-zero),
/// returning the last error in the latter case.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> PollPolicy {
        PollPolicy::new(max_attempts, Duration::from_millis(1))
    }

    fn always<E>(_: &E) -> bool {
        true
    }

    #[test]
    fn default_budgets_match_boot_and_health_ceilings() {
        assert_eq!(PollPolicy::INSTANCE_BOOT.max_attempts, 30);
        assert_eq!(PollPolicy::INSTANCE_BOOT.interval, Duration::from_secs(5));
        assert_eq!(PollPolicy::CLUSTER_HEALTH.max_attempts, 60);
        assert_eq!(PollPolicy::CLUSTER_HEALTH.interval, Duration::from_secs(10));
        assert_eq!(PollPolicy::CLUSTER_HEALTH.ceiling(), Duration::from_secs(590));
    }

    #[tokio::test]
    async fn fixed_poll_returns_first_success() {
        let result: Result<i32, PollError<&str>> =
            retry_fixed(&fast(3), "answer", always, || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn fixed_poll_keeps_trying_until_condition_holds() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<u32, PollError<String>> = retry_fixed(&fast(5), "members", always, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("expected 7 members, found {}", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fixed_poll_reports_last_error_when_budget_is_spent() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), PollError<String>> = retry_fixed(&fast(4), "leader", always, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("attempt {} saw no leader", n))
            }
        })
        .await;

        let err = match result.unwrap_err() {
            PollError::Exhausted(e) => e,
            other => panic!("expected exhausted budget, got {other:?}"),
        };
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error, "attempt 4 saw no leader");
        assert!(err.to_string().contains("gave up waiting for leader"));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_poll_never_sleeps_past_the_ceiling() {
        let policy = PollPolicy::new(30, Duration::from_secs(5));
        let start = tokio::time::Instant::now();

        let result: Result<(), PollError<&str>> =
            retry_fixed(&policy, "empty group", always, || async { Err("no instances") }).await;

        assert!(result.is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= policy.ceiling());
        assert!(elapsed < policy.ceiling() + policy.interval);
    }

    #[tokio::test]
    async fn zero_attempt_policy_still_runs_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), PollError<&str>> = retry_fixed(&fast(0), "once", always, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            }
        })
        .await;

        assert!(matches!(result, Err(PollError::Exhausted(ref e)) if e.attempts == 1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_stops_polling_without_sleeping() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let start = tokio::time::Instant::now();

        let result: Result<(), PollError<String>> = retry_fixed(
            &PollPolicy::CLUSTER_HEALTH,
            "members",
            |e: &String| !e.starts_with("malformed"),
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 2 {
                        Err("no leader yet".to_string())
                    } else {
                        Err("malformed gcloud output".to_string())
                    }
                }
            },
        )
        .await;

        assert_eq!(
            result,
            Err(PollError::Terminal("malformed gcloud output".to_string()))
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
        // one sleep between the two attempts, none after the terminal one
        let elapsed = start.elapsed();
        assert!(elapsed >= PollPolicy::CLUSTER_HEALTH.interval);
        assert!(elapsed < PollPolicy::CLUSTER_HEALTH.interval * 2);
    }

    #[tokio::test]
    async fn backoff_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
