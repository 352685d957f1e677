//! Retry Logic with Exponential Backoff
//!
//! Shared retry machinery for remote calls. Used by the connection pool when
//! opening a backing document and by the batch queue when re-sending a failed
//! batch.
//!
//! ## Backoff Calculation
//!
//! ```text
//! backoff = min(base * multiplier^attempt, cap)
//!
//! Example with queue defaults (200ms base, 2x multiplier, 10s cap):
//! - Attempt 1 fails → wait 200ms
//! - Attempt 2 fails → wait 400ms
//! - Attempt 3 fails → wait 800ms
//! - Attempt 4 fails → reject (max_attempts = 4)
//! ```
//!
//! Jitter (±25%) prevents synchronized retries across queues after a shared
//! quota rejection.
//!
//! Only transient errors (`RemoteError::is_transient`) are retried; terminal
//! errors return immediately with the attempt count they failed on.

use crate::remote::RemoteError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy: total attempt budget and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retries).
    pub max_attempts: usize,

    /// Initial backoff after the first failed attempt.
    pub base: Duration,

    /// Backoff ceiling.
    pub cap: Duration,

    /// Exponential growth factor.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_millis(200),
            cap: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base: Duration, cap: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base,
            cap,
            multiplier,
        }
    }

    /// Backoff after the given failed attempt (0-indexed), capped.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis as u64).min(self.cap)
    }

    /// Backoff with ±25% jitter.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let base = self.backoff(attempt);
        let jitter = 0.75 + (rand::random::<f64>() * 0.5); // 0.75-1.25x
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }
}

/// Retry an operation with jittered exponential backoff.
///
/// Transient errors are retried up to `policy.max_attempts` total attempts;
/// terminal errors and exhaustion return the last error.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_transient() {
                    warn!(error = %err, "terminal error, giving up");
                    return Err(err);
                }

                if attempt + 1 >= policy.max_attempts {
                    warn!(
                        attempts = attempt + 1,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "attempts exhausted, giving up"
                    );
                    return Err(err);
                }

                let backoff = policy.jittered_backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %err,
                    "transient error, backing off"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
