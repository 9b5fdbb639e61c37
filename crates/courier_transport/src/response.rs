//! Responses and admission results.

use crate::error::TransportError;
use crate::request::{Payload, RequestId};
use std::time::Duration;

/// Outcome of one admitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    request_id: RequestId,
    status: Option<u16>,
    payload: Option<Payload>,
    error: Option<TransportError>,
    retry_after: Option<Duration>,
}

impl Response {
    /// Builds a response from an HTTP status, classifying it.
    pub fn from_status(request_id: RequestId, status: u16, payload: Option<Payload>) -> Self {
        Self::from_http(request_id, status, payload, None)
    }

    /// Builds a response from an HTTP status and an optional `Retry-After`.
    pub fn from_http(
        request_id: RequestId,
        status: u16,
        payload: Option<Payload>,
        retry_after: Option<Duration>,
    ) -> Self {
        let error = match status {
            401 => Some(TransportError::AuthenticationFailed(format!(
                "backend rejected credentials ({status})"
            ))),
            420 | 429 => Some(TransportError::TryAgainLater { retry_after }),
            500..=599 => Some(TransportError::network(format!("server error {status}"))),
            _ => None,
        };
        Self {
            request_id,
            status: Some(status),
            payload,
            error,
            retry_after,
        }
    }

    /// Builds a response that never reached the backend or was discarded.
    pub fn failed(request_id: RequestId, error: TransportError) -> Self {
        let retry_after = match &error {
            TransportError::TryAgainLater { retry_after } => *retry_after,
            _ => None,
        };
        Self {
            request_id,
            status: None,
            payload: None,
            error: Some(error),
            retry_after,
        }
    }

    /// Returns the id of the request this answers.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns the HTTP status, if the backend answered.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Returns the payload.
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Returns the JSON payload, if any.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref().and_then(Payload::as_json)
    }

    /// Returns the transport error classification.
    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    /// Returns the backend's requested delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Returns true for a 2xx response.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && matches!(self.status, Some(200..=299))
    }

    /// Returns true for a 4xx that sending again will not fix.
    pub fn is_permanent_error(&self) -> bool {
        self.error.is_none() && matches!(self.status, Some(400..=499))
    }

    /// Returns true if the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(TransportError::Cancelled))
    }

    /// Returns true if the backend asked us to back off.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.error, Some(TransportError::TryAgainLater { .. }))
    }

    /// Returns the same response addressed to another request.
    pub(crate) fn readdressed(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Result of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnqueueResult {
    /// Capacity remained after this attempt.
    pub has_capacity: bool,
    /// The generator produced a request.
    pub generated: bool,
}

impl EnqueueResult {
    /// Returns true if the caller should poll again right away.
    pub fn should_continue(&self) -> bool {
        self.has_capacity && self.generated
    }
}
