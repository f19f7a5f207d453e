//! Core error types.

use crate::resolve::ResolveError;
use thiserror::Error;

/// Errors from compiling documents and driving sessions.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("failed to resolve '{reference}': {source}")]
    Resolve {
        reference: String,
        #[source]
        source: ResolveError,
    },

    #[error("session not started: {session_id}")]
    NotStarted { session_id: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns true if the error was raised while turning a document into a model.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. } | CoreError::Json(_)
        )
    }

    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "COMPILE_ERROR",
            CoreError::Json(_) => "COMPILE_ERROR",
            CoreError::Resolve { source, .. } => match source {
                ResolveError::NotFound(_) => "RESOURCE_NOT_FOUND",
                ResolveError::Transport(_) | ResolveError::Io(_) => "TRANSPORT_ERROR",
            },
            CoreError::NotStarted { .. } => "INVALID_STATE",
        }
    }
}
