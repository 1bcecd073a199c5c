//! Chunk store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk not found: upload {upload_id} index {index}")]
    ChunkNotFound { upload_id: String, index: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
