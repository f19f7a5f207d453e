//! Archive extraction and per-definition extraction workspaces.
//!
//! Archives are tar files, optionally gzip-compressed. Each definition
//! created from an archive gets its own directory under the workspace root,
//! which a [`LocalBackend`](crate::backend::LocalBackend) then reads from.

use crate::error::StorageError;
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Returns true if `bytes` starts with the gzip magic number.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC
}

/// Extracts a tar (or tar.gz) archive into `dest`, returning the number of
/// files written.
pub fn extract_to(bytes: &[u8], dest: &Path) -> Result<usize, StorageError> {
    let reader: Box<dyn Read + '_> = if is_gzip(bytes) {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };

    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| StorageError::Extract(e.to_string()))?;

    let mut files = 0;
    for entry in entries {
        let mut entry = entry.map_err(|e| StorageError::Extract(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| StorageError::Extract(e.to_string()))?
            .into_owned();

        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(StorageError::Extract(format!(
                "unsafe path in archive: {}",
                path.display()
            )));
        }

        let out_path = dest.join(&path);
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if !entry_type.is_file() {
            tracing::debug!("skipping non-file archive entry {}", path.display());
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| StorageError::Extract(format!("{}: {}", path.display(), e)))?;
        files += 1;
    }

    if files == 0 {
        return Err(StorageError::Extract("archive contains no files".to_string()));
    }
    Ok(files)
}

/// Extracts an archive on the blocking pool.
pub async fn extract(bytes: Bytes, dest: PathBuf) -> Result<usize, StorageError> {
    tokio::task::spawn_blocking(move || extract_to(&bytes, &dest))
        .await
        .map_err(|e| StorageError::Extract(format!("extraction task failed: {}", e)))?
}

/// Root directory holding one extraction directory per definition.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wipes and recreates the workspace root.
    pub async fn prepare(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        tokio::fs::create_dir_all(&self.root).await?;
        tracing::debug!("prepared workspace at {:?}", self.root);
        Ok(())
    }

    /// Directory for a definition. The name must be a single path segment.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) => Ok(self.root.join(segment)),
            _ => Err(StorageError::InvalidReference(name.to_string())),
        }
    }

    /// Extracts `bytes` into a fresh directory for `name`, replacing any
    /// previous contents.
    pub async fn unpack(&self, name: &str, bytes: Bytes) -> Result<PathBuf, StorageError> {
        let dir = self.path_for(name)?;
        self.remove(name).await?;
        tokio::fs::create_dir_all(&dir).await?;

        if let Err(e) = extract(bytes, dir.clone()).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }
        Ok(dir)
    }

    /// Removes the directory for `name`, if present.
    pub async fn remove(&self, name: &str) -> Result<(), StorageError> {
        let dir = self.path_for(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
