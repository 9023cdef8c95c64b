//! Retry with exponential backoff for session requests
//!
//! Sits outside the session layer: callers wrap a request in [`retry`] and
//! the error kind decides whether another attempt is worthwhile.

use std::future::Future;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), doubling up to the cap
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Retry `op` while it fails with a retryable error
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(policy, Error::is_retryable, op).await
}

/// Retry `op` while `should_retry` accepts the error
pub async fn retry_if<T, F, Fut, P>(policy: &RetryPolicy, should_retry: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && should_retry(&e) => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
