use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        let base_delay = Duration::from_millis(config.retry_base_delay_ms);
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_millis(config.retry_max_delay_ms).max(base_delay),
        }
    }

    /// Sleep after the given failed attempt (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` attempts were made. Returns the last error.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            label,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "request failed; retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
