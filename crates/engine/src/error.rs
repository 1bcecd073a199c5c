//! Engine error taxonomy.

use sluice_registry::RegistryError;
use sluice_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("chunk {index} size mismatch: got {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("chunk {index} hash mismatch")]
    HashMismatch { index: u32 },

    #[error("upload {upload_id} cannot merge, missing chunks: {missing:?}")]
    MissingChunks {
        upload_id: String,
        missing: Vec<u32>,
    },

    #[error("upload {upload_id} merged to {actual} bytes, declared {declared}")]
    SizeMismatch {
        upload_id: String,
        declared: u64,
        actual: u64,
    },

    #[error("timed out waiting for merge of upload {0}")]
    MergeTimeout(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(RegistryError),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RegistryError> for EngineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => EngineError::NotFound(id),
            RegistryError::InvalidState { upload_id, status } => EngineError::Conflict(format!(
                "upload {upload_id} is in state {status}"
            )),
            other => EngineError::Registry(other),
        }
    }
}

impl From<sluice_core::Error> for EngineError {
    fn from(e: sluice_core::Error) -> Self {
        EngineError::InvalidRequest(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
