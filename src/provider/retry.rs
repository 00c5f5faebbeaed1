//! Retry with exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;

use super::ProviderResult;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    max_attempts: u32,
    /// Delay after the first failure.
    base_delay: Duration,
    /// Cap on the computed backoff.
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    /// Creates a retry policy. `max_attempts` is raised to at least 1.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Attempts including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-based).
    ///
    /// The backoff doubles per attempt up to `max_delay`; a provider
    /// retry-after larger than that wins.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);

        error
            .retry_after_secs()
            .map(Duration::from_secs)
            .map_or(backoff, |requested| backoff.max(requested))
    }

    /// Runs `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    ///
    /// # Errors
    ///
    /// Non-retryable errors are returned as they are. A retryable error on
    /// the last attempt becomes `RetriesExhausted` naming `node`.
    pub async fn run<T, F, Fut>(&self, node: &str, mut operation: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!("Giving up on {node} after {attempt} attempts: {e}");
                    return Err(ProviderError::RetriesExhausted {
                        node: node.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt, &e);
                    debug!(
                        "Attempt {attempt}/{} for {node} failed ({e}), retrying in {}ms",
                        self.max_attempts,
                        delay.as_millis()
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
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        let transient = ProviderError::transient("blip");

        assert_eq!(policy.delay_for(1, &transient), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, &transient), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, &transient), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4, &transient), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40, &transient), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_after_raises_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        let throttled = ProviderError::Throttled { retry_after_secs: 3 };
        assert_eq!(policy.delay_for(1, &throttled), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(5)
            .run("fs", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Throttled { retry_after_secs: 0 })
                } else {
                    Ok("fs-1")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "fs-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = fast(3)
            .run("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::transient("503"))
            })
            .await;

        match result {
            Err(ProviderError::RetriesExhausted { node, attempts, last }) => {
                assert_eq!(node, "svc");
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ProviderError::Transient { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: ProviderResult<()> = fast(5)
            .run("lb", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::rejected(400, "bad scheme"))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Rejected { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
