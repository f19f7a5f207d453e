//! Storage error types.

use chartd_core::ResolveError;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("invalid resource reference: {0}")]
    InvalidReference(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("archive extraction failed: {0}")]
    Extract(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "NOT_FOUND",
            StorageError::InvalidReference(_) => "NOT_FOUND",
            StorageError::Transport(_) => "TRANSPORT_ERROR",
            StorageError::Extract(_) => "EXTRACT_ERROR",
            StorageError::Io(_) => "IO_ERROR",
        }
    }

    /// Returns true if the resource simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound(_) | StorageError::InvalidReference(_)
        )
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Transport(e.to_string())
    }
}

impl From<StorageError> for ResolveError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(r) => ResolveError::NotFound(r),
            StorageError::InvalidReference(r) => ResolveError::NotFound(r),
            StorageError::Transport(msg) => ResolveError::Transport(msg),
            StorageError::Extract(msg) => ResolveError::Io(msg),
            StorageError::Io(e) => ResolveError::Io(e.to_string()),
        }
    }
}
