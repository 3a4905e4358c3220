//! Backoff profiles for the two retry lanes
//!
//! Failed shards are requeued rather than retried in place, so the profiles
//! here only compute delays: a short, exponentially growing fast lane for
//! transient failures and a long flat slow lane for persistent ones. Jitter
//! keeps a burst of failing shards from thundering back in lockstep.
//!
//! [`retry_with_backoff`] wraps the one case that must block instead of
//! requeue: operations at startup with nothing to fall back on.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Delay schedule for one retry lane
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the computed delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
}

impl RetryConfig {
    /// The fast lane: transient remote errors
    ///
    /// Short delays, bounded attempt count; the sync engine escalates to the
    /// slow lane when attempts run out.
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_attempts: 5,
        }
    }

    /// The slow lane: persistent remote errors
    pub fn slow() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            max_attempts: 0,
        }
    }

    /// Jittered delay before the given retry attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        // 0.5x to 1.5x jitter
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }

    /// True when the attempt count has exhausted this lane
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

/// Execute an async operation with exponential backoff and jitter
///
/// Retries until success, or until `max_attempts` is exhausted when the
/// config sets one. Used where a failure leaves nothing to requeue, such as
/// the startup inventory pull.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }
                let delay = config.delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
