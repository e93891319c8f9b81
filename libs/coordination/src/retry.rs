//! Bounded exponential-backoff retry policy for store operations.
//!
//! This governs connection-level retries only: an operation that still fails
//! after `max_retries` extra attempts is reported to the caller.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StoreResult;

/// Default maximum retry attempts.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between retries.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound for a single backoff delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Base delay between retries (actual delay uses exponential backoff).
    pub base_delay: Duration,
    /// Cap on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given base delay and attempt bound.
    pub fn exponential(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Policy that never retries.
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Run `op`, retrying retryable errors with backoff.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        op = op_name,
                        attempt,
                        max_retries = self.max_retries,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "store operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    debug!(op = op_name, attempts = attempt + 1, error = %err, "store operation failed");
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::StoreError;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), 10);
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(20), DEFAULT_MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::exponential(Duration::from_millis(10), 3);
        let res = policy
            .run("probe", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transport("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::exponential(Duration::from_millis(10), 2);
        let res: StoreResult<()> = policy
            .run("probe", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Timeout("slow".into()))
            })
            .await;
        assert!(matches!(res, Err(StoreError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_node_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: StoreResult<()> = RetryPolicy::default()
            .run("probe", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::NoNode("/x".into()))
            })
            .await;
        assert!(res.unwrap_err().is_no_node());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
