use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

/// Delay before the first retry; doubles with every further attempt.
pub const BASE_BACKOFF_MS: u64 = 100;

/// `100ms * 2^(attempt-1)` for the given (1-based) failed attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(factor))
}

/// Run `op`, retrying retryable failures up to `max_retries` times with
/// exponential backoff. Non-retryable errors return immediately; running out
/// of retries yields `RetryExhausted`.
pub async fn execute_with_retry<T, F, Fut>(label: &str, max_retries: u32, mut op: F) -> CacheResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CacheResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt > max_retries => {
                warn!(operation = label, attempts = attempt, error = %e, "Giving up");
                return Err(CacheError::RetryExhausted {
                    id: label.to_string(),
                    attempts: attempt,
                });
            }
            Err(e) => {
                let delay = backoff_delay(attempt);
                warn!(
                    operation = label,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
