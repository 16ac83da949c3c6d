//! Exponential backoff for transient remote failures.

use std::future::Future;
use std::time::Duration;

use crate::config::Config;
use crate::remote::RemoteError;

/// Upper bound on a single backoff sleep, including server-requested waits.
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// No retries and no sleeping.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at one minute. A `Retry-After` from the server wins when it
    /// is longer.
    pub fn delay_for(&self, attempt: u32, err: &RemoteError) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_DELAY);

        match err {
            RemoteError::RateLimited {
                retry_after_secs: Some(secs),
            } => backoff.max(Duration::from_secs(*secs).min(MAX_DELAY)),
            _ => backoff,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. The last error is returned.
    pub async fn run<F, Fut, T>(&self, what: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(what, retries = attempt, "Remote call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, &e);
                    tracing::warn!(
                        what,
                        error = %e,
                        retry = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Transient remote failure, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
