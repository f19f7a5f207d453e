//! Resource resolution hook handed to the interpreter at compile time.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Why a resource could not be fetched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Fetches a resource referenced by a machine document.
///
/// `reference` is either an absolute URL or a name relative to the
/// resolver's storage root.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<Bytes, ResolveError>;
}

/// Resolver for documents that are not allowed to reference anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

#[async_trait]
impl ResourceResolver for NoResolver {
    async fn fetch(&self, reference: &str) -> Result<Bytes, ResolveError> {
        Err(ResolveError::NotFound(reference.to_string()))
    }
}
