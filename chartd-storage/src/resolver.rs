//! Storage resolver: routes references to HTTP or to the configured backend.

use crate::backend::{join_key, Backend};
use crate::error::StorageError;
use crate::remote::{is_absolute_url, HttpFetcher};
use async_trait::async_trait;
use bytes::Bytes;
use chartd_core::{ResolveError, ResourceResolver};
use std::sync::Arc;

/// Resolves resource references for machine definitions.
///
/// Absolute URLs are fetched over HTTP. Relative names go to the backend,
/// if one is configured.
#[derive(Clone)]
pub struct StorageResolver {
    backend: Option<Arc<dyn Backend>>,
    http: HttpFetcher,
}

impl StorageResolver {
    pub fn new(backend: Option<Arc<dyn Backend>>, http: HttpFetcher) -> Self {
        Self { backend, http }
    }

    /// A resolver that only follows absolute URLs.
    pub fn http_only() -> Self {
        Self::new(None, HttpFetcher::new())
    }

    /// Returns a copy of this resolver reading relative names from `backend`.
    pub fn with_backend(&self, backend: Arc<dyn Backend>) -> Self {
        Self {
            backend: Some(backend),
            http: self.http.clone(),
        }
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.as_ref().map(|b| b.kind()).unwrap_or("none")
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Fetches a reference, scoping relative names under `namespace`.
    pub async fn fetch(
        &self,
        namespace: Option<&str>,
        reference: &str,
    ) -> Result<Bytes, StorageError> {
        if is_absolute_url(reference) {
            return self.http.fetch(reference).await;
        }

        match &self.backend {
            Some(backend) => backend.get(&join_key(namespace, reference)).await,
            None => Err(StorageError::NotFound(reference.to_string())),
        }
    }

    /// Binds this resolver to a namespace for use as an interpreter hook.
    pub fn scoped(&self, namespace: Option<&str>) -> ScopedResolver {
        ScopedResolver {
            inner: self.clone(),
            namespace: namespace.map(str::to_string),
        }
    }
}

impl std::fmt::Debug for StorageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageResolver")
            .field("backend", &self.backend_kind())
            .finish()
    }
}

/// A [`StorageResolver`] bound to one namespace.
#[derive(Debug, Clone)]
pub struct ScopedResolver {
    inner: StorageResolver,
    namespace: Option<String>,
}

impl ScopedResolver {
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

#[async_trait]
impl ResourceResolver for ScopedResolver {
    async fn fetch(&self, reference: &str) -> Result<Bytes, ResolveError> {
        self.inner
            .fetch(self.namespace.as_deref(), reference)
            .await
            .map_err(|e| {
                tracing::debug!("failed to resolve '{}': {}", reference, e);
                ResolveError::from(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn memory_resolver() -> StorageResolver {
        let backend = MemoryBackend::new();
        backend.put("light/index.json", &b"root"[..]);
        backend.put("light/fragments/a.json", &b"fragment"[..]);
        StorageResolver::new(Some(Arc::new(backend)), HttpFetcher::new())
    }

    #[tokio::test]
    async fn test_scoped_fetch() {
        let resolver = memory_resolver().scoped(Some("light"));

        assert_eq!(&resolver.fetch("index.json").await.unwrap()[..], b"root");
        assert_eq!(
            &resolver.fetch("fragments/a.json").await.unwrap()[..],
            b"fragment"
        );
    }

    #[tokio::test]
    async fn test_scoped_fetch_not_found() {
        let resolver = memory_resolver().scoped(Some("other"));
        let err = resolver.fetch("index.json").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_backend() {
        let resolver = StorageResolver::http_only();
        assert_eq!(resolver.backend_kind(), "none");

        let err = resolver.fetch(Some("light"), "index.json").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_escape_is_not_found() {
        let resolver = memory_resolver().scoped(Some("light"));
        let err = resolver.fetch("../light/index.json").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }
}
