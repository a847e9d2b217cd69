//! Retry with capped exponential backoff for per-envelope work
//!
//! Used by consumers around transient collaborator calls (feature store,
//! downstream publish). Errors the caller classifies as permanent are
//! returned immediately without sleeping.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure (doubles on each retry)
    pub initial_backoff: Duration,
    /// Cap on the delay between attempts
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay slept after the `attempt`-th failure (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Retry a fallible async operation while `is_transient` says so
///
/// # Arguments
/// * `operation` - Produces a fresh future per attempt
/// * `config` - Retry configuration
/// * `context` - Context string for logging (e.g., "fetch_features")
/// * `is_transient` - Whether an error is worth another attempt
///
/// # Returns
/// * `Ok(T)` as soon as one attempt succeeds
/// * `Err(E)` on the first permanent error, or the last error once attempts
///   are exhausted
///
/// # Example
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let value = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "example_operation",
///     |_| true,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    operation: F,
    config: &RetryConfig,
    context: &str,
    is_transient: P,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) if attempt >= config.max_attempts => {
                warn!(
                    context = %context,
                    attempts = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                let backoff = config.backoff_for(attempt);
                warn!(
                    context = %context,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );
                sleep(backoff).await;
            }
        }
    }
}
