//! Bounded retry combinator shared by mutation, remediation and validation retries.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total tries, including the first. Zero means the operation never runs.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

/// Final result of a bounded retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded on the given (1-based) attempt.
    Succeeded { value: T, attempts: u32 },
    /// Every attempt failed; `last_error` is `None` only when no attempt ran.
    Exhausted { attempts: u32, last_error: Option<E> },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Run `op` up to `policy.max_attempts` times, stopping at the first `Ok`.
///
/// `op` receives the 1-based attempt number. The delay is applied between
/// attempts, never after the last one.
pub async fn with_retries<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        if attempt > 1 && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                }
            }
            Err(e) => {
                debug!(attempt, max_attempts = policy.max_attempts, "attempt failed");
                last_error = Some(e);
            }
        }
    }
    RetryOutcome::Exhausted {
        attempts: policy.max_attempts,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let calls = Cell::new(0u32);
        let outcome: RetryOutcome<u32, &str> = with_retries(RetryPolicy::immediate(5), |n| {
            calls.set(calls.get() + 1);
            async move { if n == 2 { Ok(n) } else { Err("nope") } }
        })
        .await;

        assert_eq!(outcome, RetryOutcome::Succeeded { value: 2, attempts: 2 });
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_error() {
        let outcome: RetryOutcome<(), u32> =
            with_retries(RetryPolicy::immediate(3), |n| async move { Err(n) }).await;
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 3,
                last_error: Some(3)
            }
        );
    }

    #[tokio::test]
    async fn test_zero_attempts_never_runs() {
        let calls = Cell::new(0u32);
        let outcome: RetryOutcome<(), ()> = with_retries(RetryPolicy::immediate(0), |_| {
            calls.set(calls.get() + 1);
            async { Ok(()) }
        })
        .await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 0);
        assert_eq!(calls.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_attempts_only() {
        let start = tokio::time::Instant::now();
        let _: RetryOutcome<(), ()> = with_retries(
            RetryPolicy::new(3, Duration::from_secs(10)),
            |_| async { Err(()) },
        )
        .await;
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }
}
