//! # chartd-storage
//!
//! Storage layer for chartd.
//!
//! This crate provides:
//! - Storage backends (local directory, object store, in-memory)
//! - HTTP fetching of absolute resource URLs
//! - The resolver handed to the interpreter at compile time
//! - Archive extraction into per-definition workspaces

pub mod archive;
pub mod backend;
pub mod error;
pub mod remote;
pub mod resolver;

pub use archive::{extract, is_gzip, Workspace};
pub use backend::{Backend, LocalBackend, MemoryBackend};
pub use error::StorageError;
pub use remote::{is_absolute_url, HttpFetcher, ObjectStoreBackend};
pub use resolver::{ScopedResolver, StorageResolver};
