//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid chunk size: {size} (must be between {min} and {max})")]
    InvalidChunkSize { size: u64, min: u64, max: u64 },

    #[error("chunk count {total} exceeds maximum {max}")]
    TooManyChunks { total: u64, max: u64 },

    #[error("invalid upload session: {0}")]
    InvalidSession(String),

    #[error("unknown upload status: {0}")]
    InvalidStatus(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
