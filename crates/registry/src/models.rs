//! Database row models.

use sluice_core::{UploadId, UploadSession, UploadStatus};
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::error::{RegistryError, Result};

/// Raw `upload_sessions` row.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub upload_id: String,
    pub filename: String,
    pub declared_size: i64,
    pub target_dir: String,
    pub submitter: String,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub final_path: Option<String>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
}

impl SessionRow {
    pub fn into_session(self) -> Result<UploadSession> {
        let timestamp = |secs: i64| {
            OffsetDateTime::from_unix_timestamp(secs).map_err(|e| {
                RegistryError::Core(sluice_core::Error::InvalidSession(format!(
                    "bad timestamp in registry row: {e}"
                )))
            })
        };
        Ok(UploadSession {
            upload_id: UploadId::parse(&self.upload_id)?,
            filename: self.filename,
            declared_size: self.declared_size as u64,
            target_dir: self.target_dir,
            submitter: self.submitter,
            chunk_size: self.chunk_size as u64,
            total_chunks: self.total_chunks as u64,
            status: UploadStatus::parse(&self.status)?,
            created_at: timestamp(self.created_at)?,
            updated_at: timestamp(self.updated_at)?,
            final_path: self.final_path,
            error_code: self.error_code,
            error_detail: self.error_detail,
        })
    }
}
