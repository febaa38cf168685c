//! Error types for bloatprobe
//!
//! This module provides the error handling for the engine, including:
//! - A first-class `Cancelled` variant distinct from failures (phase-end
//!   aborts are control flow, not errors)
//! - A `TransportError` sub-enum for per-operation transport failures
//! - Fatal errors that abort a run without promoting partial results

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bloatprobe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bloatprobe
///
/// This is the primary error type used throughout the engine. `Cancelled`
/// deserves special attention: consumers must never treat it as a failure.
/// It is produced whenever an in-flight operation is aborted because its
/// phase ended or the test was stopped.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "endpoints.base_url")
        key: Option<String>,
    },

    /// Transport-level failure (HTTP or WebSocket)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The operation was aborted by a cancellation token.
    ///
    /// This is control flow, not a failure: phase-end aborts and user stops
    /// surface as this variant and are never logged as errors.
    #[error("operation cancelled")]
    Cancelled,

    /// A fatal condition that aborts the run (no partial results promoted)
    #[error("fatal: {0}")]
    Fatal(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid endpoint URL
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Test already running, or an operation arrived in the wrong state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Transport-level errors for individual HTTP and WebSocket operations
///
/// These are the per-op failures the retry layer classifies. Timeouts and
/// 5xx responses are transient; a closed socket is handled by the worker's
/// reconnect path rather than per-op retry.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connect, read, or write)
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Server returned an unexpected status code
    #[error("unexpected status {status} from {endpoint}")]
    BadStatus {
        /// The HTTP status code that was returned
        status: u16,
        /// The endpoint that returned it
        endpoint: String,
    },

    /// The operation exceeded its deadline
    #[error("timed out after {timeout:?} during {operation}")]
    Timeout {
        /// What was being attempted (e.g., "upload POST", "WebSocket open")
        operation: String,
        /// The timeout that expired
        timeout: Duration,
    },

    /// WebSocket protocol or connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The remote closed the connection mid-operation
    #[error("connection closed by remote")]
    Closed,
}

impl Error {
    /// True if this error is the cancellation marker.
    ///
    /// Callers use this to short-circuit logging: cancellation on phase end
    /// must never appear in logs as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True if this error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Convenience constructor for a per-op timeout
    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Error::Transport(TransportError::Timeout {
            operation: operation.into(),
            timeout,
        })
    }

    /// Convenience constructor for an unexpected HTTP status
    pub(crate) fn bad_status(status: u16, endpoint: impl Into<String>) -> Self {
        Error::Transport(TransportError::BadStatus {
            status,
            endpoint: endpoint.into(),
        })
    }
}
