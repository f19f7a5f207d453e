//! Storage backends: "fetch by key returns bytes or not found".

use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

/// A keyed byte store.
///
/// Keys are slash-separated relative paths; the first segment is usually the
/// definition name.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;
}

/// Splits a key into path segments, rejecting anything that could escape
/// the storage root.
pub fn normalize_key(key: &str) -> Result<Vec<&str>, StorageError> {
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidReference(key.to_string()));
    }

    let mut segments = Vec::new();
    for segment in key.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(StorageError::InvalidReference(key.to_string())),
            s if s.contains('\\') || s.contains(':') => {
                return Err(StorageError::InvalidReference(key.to_string()))
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(StorageError::InvalidReference(key.to_string()));
    }
    Ok(segments)
}

/// Joins a namespace and a relative reference into a backend key.
pub fn join_key(namespace: Option<&str>, reference: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns.trim_end_matches('/'), reference),
        None => reference.to_string(),
    }
}

/// Files under a local directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to a path inside the root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for segment in normalize_key(key)? {
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Process-local store, used for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: DashMap<String, Bytes>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, bytes: impl Into<Bytes>) {
        self.objects.insert(key.into(), bytes.into());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.objects.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let normalized = normalize_key(key)?.join("/");
        self.objects
            .get(&normalized)
            .map(|b| b.clone())
            .ok_or(StorageError::NotFound(normalized))
    }
}
