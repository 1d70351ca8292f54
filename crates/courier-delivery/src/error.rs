//! Error types for webhook delivery operations.
//!
//! Attempt-level failures (rate limiting, transport, timeouts, receiver
//! status codes) are recorded on the attempt row and drive the retry
//! protocol. Engine-level failures (storage, configuration, worker
//! lifecycle) surface to the caller.

use courier_core::{AttemptErrorKind, CoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised while delivering webhooks.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The per-webhook rate limiter denied the attempt.
    #[error("rate limit exceeded for webhook")]
    RateLimited,

    /// Connection, DNS, TLS, or allowlist failure.
    #[error("transport failure: {message}")]
    Transport {
        /// Error message describing the failure
        message: String,
    },

    /// No response within the delivery timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout in seconds
        timeout_seconds: u64,
    },

    /// Receiver answered with a non-2xx status.
    #[error("receiver returned HTTP {status_code}")]
    Receiver {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// The payload could not be signed; no request was sent.
    #[error("signing failed: {message}")]
    Signing {
        /// Error message
        message: String,
    },

    /// The webhook was deactivated or deleted after the attempt was queued.
    #[error("delivery cancelled: {reason}")]
    Cancelled {
        /// Why the attempt was skipped
        reason: String,
    },

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// Invalid engine or client configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// A worker task panicked.
    #[error("worker panicked: {message}")]
    WorkerPanic {
        /// Panic description
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Configured shutdown timeout in seconds
        timeout_seconds: u64,
    },
}

impl DeliveryError {
    /// Creates a transport error from a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a receiver error from an HTTP response.
    pub fn receiver(status_code: u16, body: impl Into<String>) -> Self {
        Self::Receiver { status_code, body: body.into() }
    }

    /// Creates a signing error.
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing { message: message.into() }
    }

    /// Creates a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled { reason: reason.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the failed attempt is eligible for the retry protocol.
    ///
    /// Rate limiting, transport failures, timeouts, and every non-2xx
    /// receiver status are transient. Signing failures and cancellations end
    /// the pair immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited
            | Self::Transport { .. }
            | Self::Timeout { .. }
            | Self::Receiver { .. } => true,

            Self::Signing { .. }
            | Self::Cancelled { .. }
            | Self::Storage(_)
            | Self::Configuration { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }

    /// Classification stored on the attempt row, for attempt-level errors.
    pub fn attempt_error_kind(&self) -> Option<AttemptErrorKind> {
        match self {
            Self::RateLimited => Some(AttemptErrorKind::RateLimited),
            Self::Transport { .. } => Some(AttemptErrorKind::Transport),
            Self::Timeout { .. } => Some(AttemptErrorKind::Timeout),
            Self::Receiver { .. } => Some(AttemptErrorKind::Receiver),
            Self::Signing { .. } => Some(AttemptErrorKind::Signing),
            Self::Cancelled { .. } => Some(AttemptErrorKind::Cancelled),
            Self::Storage(_)
            | Self::Configuration { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. } => None,
        }
    }

    /// Status code carried by receiver errors.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Receiver { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}
