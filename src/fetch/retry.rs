//! Retry with exponential backoff for transient service errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::FetchError;
use crate::remote::RemoteError;

/// Upper bound for a single backoff sleep, jitter included.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Jitter applied around the exponential delay (±25%).
const JITTER_FRACTION: f64 = 0.25;

/// Retry settings for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each subsequent one
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }
}

/// Backoff before retry number `attempt` (0-based), using the thread RNG.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    backoff_delay_with(base, attempt, &mut rand::thread_rng())
}

/// `min(60s, base * 2^attempt)` jittered uniformly by ±25%, never above 60s.
pub fn backoff_delay_with<R: Rng + ?Sized>(base: Duration, attempt: u32, rng: &mut R) -> Duration {
    let cap_ms = MAX_BACKOFF.as_millis() as f64;
    // 2^63 already exceeds any cap; clamping keeps powi finite.
    let factor = 2f64.powi(attempt.min(63) as i32);
    let delay_ms = (base.as_millis() as f64 * factor).min(cap_ms);

    let jitter = delay_ms * JITTER_FRACTION;
    let jittered = delay_ms - jitter + rng.gen::<f64>() * 2.0 * jitter;

    Duration::from_millis(jittered.clamp(0.0, cap_ms) as u64)
}

/// Run `call` until it succeeds, fails terminally, exhausts the policy or
/// `cancel` fires.
///
/// Only transient errors are retried. Cancellation is observed before every
/// attempt, while the call is in flight and during backoff sleeps.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    account_id: &str,
    mut call: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = call() => result,
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(operation, account_id, attempt, "Call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = backoff_delay(policy.base_backoff, attempt);
                tracing::warn!(
                    operation,
                    account_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying after backoff"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => {
                let attempts = attempt + 1;
                tracing::debug!(operation, account_id, attempts, error = %err, "Call failed terminally");
                return Err(FetchError::from_remote(err, attempts));
            }
        }
    }
}
