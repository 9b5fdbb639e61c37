//! Error types for the transport layer.

use std::time::Duration;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Classification of a failed request.
///
/// Every admitted request resolves either with a successful response or with
/// exactly one of these. The scheduler never retries on its own; what to do
/// next is up to whoever generated the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No valid access token could be obtained, or the backend rejected it.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The request passed its deadline before a response arrived.
    #[error("request expired")]
    Expired,

    /// The request was cancelled explicitly.
    #[error("request cancelled")]
    Cancelled,

    /// The backend asked us to back off.
    #[error("backend asked to try again later")]
    TryAgainLater {
        /// Delay requested by the backend, if it sent one.
        retry_after: Option<Duration>,
    },

    /// Network-level failure.
    #[error("transport failure: {message}")]
    TransportFailure {
        /// Error message.
        message: String,
        /// Whether the same request may succeed if sent again.
        retryable: bool,
    },
}

impl TransportError {
    /// Creates a retryable transport failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a transcoder may send the same logical unit again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::TransportFailure { retryable, .. } => *retryable,
            TransportError::Expired => true,
            TransportError::TryAgainLater { .. } => true,
            TransportError::AuthenticationFailed(_) | TransportError::Cancelled => false,
        }
    }

    /// Short stable label, used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            TransportError::AuthenticationFailed(_) => "authentication_failed",
            TransportError::Expired => "expired",
            TransportError::Cancelled => "cancelled",
            TransportError::TryAgainLater { .. } => "try_again_later",
            TransportError::TransportFailure { .. } => "transport_failure",
        }
    }
}

/// Errors reading or writing the background recovery log.
#[derive(Error, Debug)]
pub enum RecoveryLogError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The log could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// The log on disk is not a valid recovery log.
    #[error("decode error: {0}")]
    Decode(String),
}
