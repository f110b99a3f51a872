//! Bounded retry with exponential backoff.
//!
//! Used for transient external failures only (object transfers, flaky
//! HTTP). Anything the caller cannot interpret as transient should be
//! propagated instead of retried.
//!
//! # Example
//!
//! ```ignore
//! use plf_common::{retry_with_backoff, RetryConfig};
//!
//! let body = retry_with_backoff(
//!     &RetryConfig::bounded(4, Duration::from_secs(1)),
//!     "get_object",
//!     || async { store.get(bucket, key).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
    /// Randomise each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A config with a maximum number of attempts and jittered delays
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Deterministic doubling schedule: `initial`, `2 * initial`, `4 * initial`, ...
    ///
    /// `bounded(4, 1s)` waits 1s, 2s, then 4s between its four attempts.
    pub fn bounded(attempts: u32, initial: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: initial,
            max_delay: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay to sleep after the given failed attempt (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Execute an async operation with exponential backoff.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted. Every error is treated as transient; use
/// [`retry_with_backoff_if`] when some errors are permanent.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but only errors for which `retryable`
/// returns true are retried. Anything else is returned after one attempt.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !retryable(&e) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed with a permanent error"
                    );
                    return Err(e);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let mut delay = config.delay_for(attempt);
                if config.jitter {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
