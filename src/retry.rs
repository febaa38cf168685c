//! Retry logic for transient transport failures
//!
//! Saturation POSTs retry once after 500 ms per the default [`RetryConfig`];
//! the helper itself supports exponential backoff with optional jitter for
//! the general case. Cancellation is control flow and is never retried.

use crate::config::RetryConfig;
use crate::error::{Error, TransportError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connect failures, 5xx) should return `true`.
/// Permanent failures and cancellation must return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Cancellation is control flow, never a retry candidate
            Error::Cancelled => false,
            Error::Transport(e) => e.is_retryable(),
            // I/O errors can be retryable in some cases
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Config errors are permanent (fallbacks substitute instead)
            Error::Config { .. } => false,
            // Fatal aborts the run
            Error::Fatal(_) => false,
            // Serialization errors are permanent
            Error::Serialization(_) => false,
            // Bad URLs are permanent
            Error::InvalidUrl(_) => false,
            // State errors need a different call, not the same one again
            Error::InvalidState(_) => false,
            // Unknown errors - be conservative and don't retry
            Error::Other(_) => false,
        }
    }
}

impl IsRetryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::Request(e) => e.is_timeout() || e.is_connect(),
            // 5xx and throttling responses are worth one more try
            TransportError::BadStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            TransportError::Timeout { .. } => true,
            // A broken socket is handled by the worker's reconnect path,
            // not by replaying the failed frame
            TransportError::WebSocket(_) => false,
            TransportError::Closed => false,
        }
    }
}

/// Execute an async operation, retrying transient failures with backoff
///
/// # Arguments
///
/// * `config` - Retry configuration (max attempts, delays, backoff multiplier, jitter)
/// * `operation` - Async closure returning `Result<T, E>` where `E: IsRetryable`
///
/// # Returns
///
/// The successful result, or the last error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
