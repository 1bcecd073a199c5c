//! Storage abstraction for staged upload chunks.

use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::UploadId;
use std::collections::BTreeSet;

use crate::error::Result;

/// Backend holding the staged chunks of in-flight upload sessions.
///
/// Implementations must make `write_chunk` atomic: a concurrent reader never
/// observes a partially written chunk, and rewriting an existing index fully
/// replaces the previous bytes.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Prepare the staging area for a session. Idempotent.
    async fn create_staging(&self, upload_id: &UploadId) -> Result<()>;

    /// Persist one chunk. Overwrites any previous write of the same index.
    async fn write_chunk(&self, upload_id: &UploadId, index: u32, data: Bytes) -> Result<()>;

    /// Read one chunk back.
    async fn read_chunk(&self, upload_id: &UploadId, index: u32) -> Result<Bytes>;

    /// Byte length of a staged chunk.
    async fn chunk_len(&self, upload_id: &UploadId, index: u32) -> Result<u64>;

    /// Whether a chunk is staged.
    async fn exists(&self, upload_id: &UploadId, index: u32) -> Result<bool>;

    /// Indices of all staged chunks for a session, in ascending order.
    async fn list_indices(&self, upload_id: &UploadId) -> Result<BTreeSet<u32>>;

    /// Remove the session's staging area and everything in it. Idempotent.
    async fn delete_all(&self, upload_id: &UploadId) -> Result<()>;
}
