//! Bounded retry with exponential backoff for calls to external collaborators.
//!
//! Every alias lookup, archive read and dispatch goes through [`with_retry`].
//! Each attempt runs under a timeout; only transient errors are retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{AliasError, ArchiveError, DispatchError};

/// Errors that know whether another attempt could succeed.
pub trait Retryable: std::error::Error {
    /// Whether the failure may go away on its own (network, throttling, races).
    fn is_transient(&self) -> bool;

    /// The error reported when an attempt exceeds the call timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Retry budget shared by all external calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later one.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Timeout applied to every individual attempt.
    pub call_timeout: Duration,
    /// Delays are randomized within ±`jitter_factor`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            call_timeout: Duration::from_secs(10),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(5),
            jitter_factor: 0.0,
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    ///
    /// `attempt` is 1-indexed: the delay after the first failure is `base_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        delay.mul_f64((1.0 + factor).max(0.0))
    }
}

/// Run `call` until it succeeds, fails permanently, or the budget is spent.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.call_timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.jittered(policy.delay_for(attempt));
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(operation, attempt, error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}

impl Retryable for AliasError {
    fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidAddress(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl Retryable for ArchiveError {
    // NotFound is retried: the edge may still be writing the object.
    fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidKey(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl Retryable for DispatchError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.1,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let d = policy.jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(899) && d <= Duration::from_millis(1101));
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<&str, ArchiveError> =
            with_retry(&RetryPolicy::immediate(3), "test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ArchiveError::NotFound { key: "k".into() })
                } else {
                    Ok("body")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "body");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), ArchiveError> =
            with_retry(&RetryPolicy::immediate(3), "test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ArchiveError::NotFound { key: "k".into() })
            })
            .await;

        assert!(matches!(result, Err(ArchiveError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), DispatchError> =
            with_retry(&RetryPolicy::immediate(5), "test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DispatchError::Rejected {
                    reason: "554 sender not authorized".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(DispatchError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_call_times_out_as_transient() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(10),
            ..RetryPolicy::immediate(2)
        };
        let calls = &AtomicU32::new(0);
        let result: Result<(), DispatchError> = with_retry(&policy, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(DispatchError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalid_address_is_permanent() {
        assert!(!AliasError::InvalidAddress("".into()).is_transient());
        assert!(
            AliasError::Backend {
                store: "libsql".into(),
                reason: "locked".into()
            }
            .is_transient()
        );
    }
}
