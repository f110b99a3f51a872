//! Readiness polling with a caller-supplied timeout.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{Error, Result};

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - Fatal error, stop polling immediately
pub type PollResult<T> = std::result::Result<Option<T>, String>;

/// Timing for a poll loop. The interval doubles after each miss, up to
/// `max_interval`.
#[derive(Clone, Debug)]
pub struct PollConfig {
    pub timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl PollConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(15),
        }
    }

    pub fn with_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }
}

/// Poll `check_fn` until it yields a value, fails, or the timeout expires.
///
/// Timeout expiry is reported as [`Error::Timeout`], which callers may
/// retry; a check error is reported as [`Error::Wait`] and is final.
///
/// # Example
/// ```ignore
/// wait_with_timeout(&PollConfig::new(Duration::from_secs(300)), "polaris ready", || async {
///     match api.get_opt(name).await {
///         Ok(Some(d)) if is_ready(&d) => Ok(Some(())),
///         Ok(_) => Ok(None),
///         Err(e) => Err(e.to_string()),
///     }
/// })
/// .await?;
/// ```
pub async fn wait_with_timeout<T, F, Fut>(
    config: &PollConfig,
    description: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();
    let mut interval = config.initial_interval;

    loop {
        match check_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                if start.elapsed() >= config.timeout {
                    return Err(Error::Timeout {
                        description: description.to_string(),
                        seconds: config.timeout.as_secs(),
                    });
                }
                debug!(interval_ms = interval.as_millis(), "Waiting for {}...", description);
                tokio::time::sleep(interval).await;
                interval = (interval * 2).min(config.max_interval);
            }
            Err(e) => {
                return Err(Error::Wait {
                    description: description.to_string(),
                    message: e,
                });
            }
        }
    }
}
