//! Drive orchestration errors

use thiserror::Error;

use crate::providers::ProviderError;

/// Errors surfaced by the drive manager to its immediate caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriveError {
    /// No active backend for an operation that requires one
    #[error("No cloud drive selected")]
    BackendNotSet,

    /// Backend-specific failure, message surfaced verbatim
    #[error("{0}")]
    Internal(String),

    /// A download of the same file on the same drive is already in flight
    #[error("{0}")]
    DownloadExists(String),

    /// A started transfer failed
    #[error("Download failed: {0}")]
    DownloadFailed(String),
}

impl From<ProviderError> for DriveError {
    fn from(err: ProviderError) -> Self {
        DriveError::Internal(err.to_string())
    }
}
