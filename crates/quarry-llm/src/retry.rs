//! Timeout plus bounded exponential backoff, applied to every outbound call.
//!
//! Embedding requests and vector-store operations share the same policy type so
//! that each call site gets an explicit per-attempt timeout and the same retry
//! budget.

use std::future::Future;
use std::time::Duration;

/// Classification hook for errors passed through [`with_retry`].
pub trait Retryable: std::fmt::Display {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;

    /// Server-provided delay hint (e.g. `Retry-After`), if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Construct the error reported when an attempt exceeds its timeout.
    fn timed_out(operation: &str, after: Duration) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay before retry number `attempt` (0-based), doubling from `base_delay`
    /// and capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `f` under `policy`: each attempt is bounded by `policy.timeout`, and
/// retryable failures are retried with exponential backoff until
/// `policy.max_attempts` is reached.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts are
/// exhausted.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match tokio::time::timeout(policy.timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => E::timed_out(operation, policy.timeout),
        };

        attempt += 1;
        if !err.is_retryable() || attempt >= attempts {
            return Err(err);
        }

        let delay = err
            .retry_after()
            .map_or_else(|| policy.backoff(attempt - 1), |hint| hint.min(policy.max_delay));
        tracing::warn!(
            operation,
            attempt,
            max_attempts = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "{err}, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Fatal,
        TimedOut,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Transient | Self::TimedOut)
        }

        fn timed_out(_operation: &str, _after: Duration) -> Self {
            Self::TimedOut
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<u32, TestError> = with_retry(&fast_policy(3), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(TestError::Transient) } else { Ok(n) }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), TestError> = with_retry(&fast_policy(5), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            }
        })
        .await;
        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), TestError> = with_retry(&fast_policy(2), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Transient)
            }
        })
        .await;
        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let mut policy = fast_policy(2);
        policy.timeout = Duration::from_millis(10);
        let result: Result<(), TestError> = with_retry(&policy, "slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TestError::TimedOut)));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = fast_policy(0);
        assert_eq!(policy.max_attempts.max(1), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap(attempt in 0u32..64, base_ms in 1u64..1000) {
            let policy = RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_secs(2),
                timeout: Duration::from_secs(1),
            };
            let delay = policy.backoff(attempt);
            prop_assert!(delay <= policy.max_delay);
            prop_assert!(delay >= policy.base_delay.min(policy.max_delay));
        }
    }
}
