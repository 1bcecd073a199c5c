//! Session registry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("upload session not found: {0}")]
    NotFound(String),

    #[error("upload {upload_id} is in state {status}, operation not allowed")]
    InvalidState { upload_id: String, status: String },

    #[error(transparent)]
    Core(#[from] sluice_core::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
