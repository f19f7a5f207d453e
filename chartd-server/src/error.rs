//! Service error types.

use chartd_core::{CoreError, ResolveError};
use chartd_storage::StorageError;
use thiserror::Error;

/// Broad error categories callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Compile,
    Extract,
    Transport,
    InstanceExists,
    InvalidState,
    InvalidRequest,
    Internal,
}

/// Errors returned by the service façade.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("archive extraction failed: {0}")]
    Extract(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("instance already exists: {0}")]
    InstanceExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::DefinitionNotFound(_)
            | ServiceError::InstanceNotFound(_)
            | ServiceError::ResourceNotFound(_) => ErrorKind::NotFound,
            ServiceError::Compile(_) => ErrorKind::Compile,
            ServiceError::Extract(_) => ErrorKind::Extract,
            ServiceError::Transport(_) => ErrorKind::Transport,
            ServiceError::InstanceExists(_) => ErrorKind::InstanceExists,
            ServiceError::InvalidState(_) => ErrorKind::InvalidState,
            ServiceError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DefinitionNotFound(_) => "DEFINITION_NOT_FOUND",
            ServiceError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            ServiceError::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            ServiceError::Compile(_) => "COMPILE_ERROR",
            ServiceError::Extract(_) => "EXTRACT_ERROR",
            ServiceError::Transport(_) => "TRANSPORT_ERROR",
            ServiceError::InstanceExists(_) => "INSTANCE_EXISTS",
            ServiceError::InvalidState(_) => "INVALID_STATE",
            ServiceError::InvalidRequest(_) => "INVALID_REQUEST",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<CoreError> for ServiceError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidDefinition { .. } | CoreError::Json(_) => {
                ServiceError::Compile(e.to_string())
            }
            CoreError::Resolve { ref source, .. } => match source {
                ResolveError::NotFound(_) => ServiceError::ResourceNotFound(e.to_string()),
                ResolveError::Transport(_) | ResolveError::Io(_) => {
                    ServiceError::Transport(e.to_string())
                }
            },
            CoreError::NotStarted { session_id } => ServiceError::InvalidState(format!(
                "instance '{}' has not been started",
                session_id
            )),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(r) | StorageError::InvalidReference(r) => {
                ServiceError::ResourceNotFound(r)
            }
            StorageError::Transport(msg) => ServiceError::Transport(msg),
            StorageError::Extract(msg) => ServiceError::Extract(msg),
            StorageError::Io(e) => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::InvalidRequest(e.to_string())
    }
}
