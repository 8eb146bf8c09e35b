//! Bounded retry with a fixed backoff.
//!
//! Lease acquisition, the ledger's optimistic stock writes and order journal
//! appends all retry transient failures the same way: a fixed number of
//! attempts with a fixed pause in between, then the last error is surfaced.

use std::future::Future;
use std::time::Duration;

/// How many times to try an operation and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// One attempt, no retry.
    pub const fn never() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// The original attempt plus a single immediate retry.
    pub const fn once() -> Self {
        Self::new(2, Duration::ZERO)
    }

    /// Longest total pause the policy can spend between attempts.
    pub fn max_wait(&self) -> Duration {
        self.backoff.saturating_mul(self.attempts() - 1)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    /// 30 attempts, 100 ms apart: roughly three seconds of contention.
    fn default() -> Self {
        Self::new(30, Duration::from_millis(100))
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy's attempt bound is reached.
pub async fn retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut operation: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_retryable(&err) => {
                tracing::debug!(attempt, max_attempts, "transient failure, retrying");
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
