//! Error types for the sync layer.

use courier_transport::{RecoveryLogError, TransportError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for object store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be used (closed, torn down).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A mutation referenced an object that does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A mutation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persisting the working state failed; it was rolled back.
    #[error("save failed: {0}")]
    SaveFailed(String),
}

/// Errors that can occur while synchronizing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Object store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Background recovery log failure.
    #[error("recovery log error: {0}")]
    Recovery(#[from] RecoveryLogError),

    /// A response or event payload could not be interpreted.
    #[error("decode error: {0}")]
    Decode(String),

    /// The engine stopped after a fatal error.
    #[error("engine failed: {0}")]
    EngineFailed(String),

    /// The engine is no longer running.
    #[error("sync engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Returns true if the engine must stop on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Store(_) | SyncError::EngineFailed(_) | SyncError::EngineStopped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_fatal() {
        assert!(SyncError::from(StoreError::SaveFailed("disk full".into())).is_fatal());
        assert!(!SyncError::decode("missing id").is_fatal());
        assert!(!SyncError::from(TransportError::Expired).is_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::from(StoreError::NotFound("abc".into()));
        assert_eq!(err.to_string(), "store error: object not found: abc");
        assert_eq!(SyncError::EngineStopped.to_string(), "sync engine stopped");
    }
}
