//! CLI command implementations.

pub mod recovery_log;
pub mod simulate;

use courier_sync::SyncError;
use courier_transport::RecoveryLogError;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The engine failed or stopped.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The recovery log could not be read.
    #[error("recovery log error: {0}")]
    RecoveryLog(#[from] RecoveryLogError),

    /// The engine did not catch up in time.
    #[error("engine did not catch up within {0:?}")]
    Timeout(Duration),

    /// Report serialization failed.
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for commands.
pub type CliResult<T> = Result<T, CliError>;
