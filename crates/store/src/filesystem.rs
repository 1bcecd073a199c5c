//! Filesystem-backed chunk store.
//!
//! Layout: `<root>/<upload_id>/chunk_<index>`. Writes go through a
//! temporary file in the same directory followed by a rename, so a chunk
//! file is either absent or complete.

use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::UploadId;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::traits::ChunkStore;

const CHUNK_PREFIX: &str = "chunk_";

pub struct FilesystemChunkStore {
    root: PathBuf,
}

impl FilesystemChunkStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn staging_dir(&self, upload_id: &UploadId) -> PathBuf {
        self.root.join(upload_id.as_str())
    }

    fn chunk_path(&self, upload_id: &UploadId, index: u32) -> PathBuf {
        self.staging_dir(upload_id)
            .join(format!("{CHUNK_PREFIX}{index}"))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Backend(format!("no parent dir for {}", path.display())))?;
        let tmp = dir.join(format!(".tmp.{}", Uuid::new_v4()));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for FilesystemChunkStore {
    async fn create_staging(&self, upload_id: &UploadId) -> Result<()> {
        fs::create_dir_all(self.staging_dir(upload_id)).await?;
        Ok(())
    }

    async fn write_chunk(&self, upload_id: &UploadId, index: u32, data: Bytes) -> Result<()> {
        let path = self.chunk_path(upload_id, index);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        Self::write_atomic(&path, &data).await?;
        tracing::trace!(upload_id = %upload_id, index, len = data.len(), "staged chunk");
        Ok(())
    }

    async fn read_chunk(&self, upload_id: &UploadId, index: u32) -> Result<Bytes> {
        let path = self.chunk_path(upload_id, index);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ChunkNotFound {
                    upload_id: upload_id.to_string(),
                    index,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn chunk_len(&self, upload_id: &UploadId, index: u32) -> Result<u64> {
        let path = self.chunk_path(upload_id, index);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ChunkNotFound {
                    upload_id: upload_id.to_string(),
                    index,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, upload_id: &UploadId, index: u32) -> Result<bool> {
        match fs::metadata(self.chunk_path(upload_id, index)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_indices(&self, upload_id: &UploadId) -> Result<BTreeSet<u32>> {
        let mut indices = BTreeSet::new();
        let mut entries = match fs::read_dir(self.staging_dir(upload_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(CHUNK_PREFIX) else {
                continue;
            };
            if let Ok(index) = suffix.parse::<u32>() {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    async fn delete_all(&self, upload_id: &UploadId) -> Result<()> {
        match fs::remove_dir_all(self.staging_dir(upload_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn test_id(seed: &str) -> UploadId {
        UploadId::derive(seed, 1, "tester", OffsetDateTime::now_utc())
    }

    async fn store() -> (tempfile::TempDir, FilesystemChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemChunkStore::new(dir.path().join("staging"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (_dir, store) = store().await;
        let id = test_id("a");

        store
            .write_chunk(&id, 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let data = store.read_chunk(&id, 0).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(store.chunk_len(&id, 0).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_chunk() {
        let (_dir, store) = store().await;
        let id = test_id("b");

        store
            .write_chunk(&id, 3, Bytes::from_static(b"first version"))
            .await
            .unwrap();
        store
            .write_chunk(&id, 3, Bytes::from_static(b"second"))
            .await
            .unwrap();
        let data = store.read_chunk(&id, 3).await.unwrap();
        assert_eq!(&data[..], b"second");
    }

    #[tokio::test]
    async fn test_missing_chunk_is_not_found() {
        let (_dir, store) = store().await;
        let id = test_id("c");

        assert!(!store.exists(&id, 0).await.unwrap());
        let err = store.read_chunk(&id, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::ChunkNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_indices_sorted() {
        let (_dir, store) = store().await;
        let id = test_id("d");

        for index in [7u32, 0, 3] {
            store
                .write_chunk(&id, index, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let indices = store.list_indices(&id).await.unwrap();
        assert_eq!(indices.into_iter().collect::<Vec<_>>(), vec![0, 3, 7]);
    }

    #[tokio::test]
    async fn test_list_indices_skips_temp_files() {
        let (_dir, store) = store().await;
        let id = test_id("e");

        store.create_staging(&id).await.unwrap();
        store
            .write_chunk(&id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let tmp = store.staging_dir(&id).join(".tmp.leftover");
        tokio::fs::write(&tmp, b"partial").await.unwrap();

        let indices = store.list_indices(&id).await.unwrap();
        assert_eq!(indices.into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_delete_all_idempotent() {
        let (_dir, store) = store().await;
        let id = test_id("f");

        store
            .write_chunk(&id, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();
        store.delete_all(&id).await.unwrap();
        assert!(!store.exists(&id, 0).await.unwrap());
        store.delete_all(&id).await.unwrap();
    }
}
