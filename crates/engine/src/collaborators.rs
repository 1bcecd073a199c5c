//! Seams to the surrounding application.
//!
//! The engine does not own the file catalog or any directory listing cache;
//! it notifies them through these traits after a merge lands.

use async_trait::async_trait;
use sluice_core::ContentHash;
use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;

use crate::error::Result;

/// Catalog entry for a merged file.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub content_hash: ContentHash,
    pub submitter: String,
    pub created_at: OffsetDateTime,
}

/// Decides whether a requested destination directory is allowed.
#[async_trait]
pub trait PathValidator: Send + Sync {
    async fn is_safe(&self, target_dir: &str) -> bool;
}

/// The application's file catalog.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn save_file_record(&self, record: &FileRecord) -> Result<()>;
    async fn delete_file_record(&self, path: &str) -> Result<()>;
}

/// Directory listing cache, invalidated when a merge adds a file.
#[async_trait]
pub trait DirectoryCache: Send + Sync {
    async fn invalidate(&self, dir: &str);
}

/// Validator that accepts absolute, traversal-free paths under a fixed set
/// of root directories.
pub struct RootedPathValidator {
    allowed_roots: Vec<PathBuf>,
}

impl RootedPathValidator {
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots }
    }
}

#[async_trait]
impl PathValidator for RootedPathValidator {
    async fn is_safe(&self, target_dir: &str) -> bool {
        let path = Path::new(target_dir);
        if !path.is_absolute() {
            return false;
        }
        // Reject `.` and `..` components instead of resolving them.
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return false;
        }
        self.allowed_roots.iter().any(|root| path.starts_with(root))
    }
}

/// No-op catalog for deployments that track files elsewhere.
pub struct NoopMetadataStore;

#[async_trait]
impl MetadataStore for NoopMetadataStore {
    async fn save_file_record(&self, _record: &FileRecord) -> Result<()> {
        Ok(())
    }

    async fn delete_file_record(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

/// No-op cache.
pub struct NoopDirectoryCache;

#[async_trait]
impl DirectoryCache for NoopDirectoryCache {
    async fn invalidate(&self, _dir: &str) {}
}
