//! Exponential backoff and bounded retries for external calls.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Backoff {
    /// Delay before attempt `attempt + 1`, doubling from `initial`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(1 << exponent)
            .min(self.max)
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Retry policy for one external call.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

/// Run `operation` with a per-attempt deadline, retrying transient failures.
///
/// A deadline overrun becomes [`Error::Timeout`], which is transient. Any
/// non-transient error is returned immediately.
pub async fn with_retry<F, Fut, T>(operation: &str, policy: CallPolicy, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout: policy.timeout,
            }),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = policy.backoff.delay(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
