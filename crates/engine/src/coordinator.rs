//! Client-facing upload operations.

use bytes::Bytes;
use serde::Serialize;
use sluice_core::{ContentHash, UploadConfig, UploadId, UploadSession, UploadStatus};
use sluice_registry::{CancelOutcome, SessionRegistry};
use sluice_store::ChunkStore;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::collaborators::PathValidator;
use crate::error::{EngineError, Result};
use crate::janitor::Janitor;
use crate::merge::MergeQueue;

/// Sessions reclaimed as a side effect of `initialize`, on top of the
/// periodic sweep.
const OPPORTUNISTIC_SWEEP_LIMIT: u32 = 16;

#[derive(Debug, Clone)]
pub struct InitializeRequest {
    pub filename: String,
    pub declared_size: u64,
    pub target_dir: String,
    pub submitter: String,
    /// Requested chunk size. `None` or `Some(0)` falls back to the
    /// configured default; nonzero values outside the allowed bounds are
    /// rejected.
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitializeReceipt {
    pub upload_id: UploadId,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReceipt {
    pub received: u64,
    pub total: u64,
    /// True once every declared chunk has been recorded.
    pub all_received: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session: UploadSession,
    pub received_indices: BTreeSet<u32>,
    pub missing_indices: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: UploadSession,
    pub received_chunks: u64,
}

/// Entry point for upload clients. Validates requests, stages chunks, and
/// hands completed sessions to the merge queue.
pub struct UploadCoordinator {
    registry: Arc<dyn SessionRegistry>,
    chunks: Arc<dyn ChunkStore>,
    validator: Arc<dyn PathValidator>,
    queue: Arc<MergeQueue>,
    janitor: Arc<Janitor>,
    config: UploadConfig,
}

impl UploadCoordinator {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        chunks: Arc<dyn ChunkStore>,
        validator: Arc<dyn PathValidator>,
        queue: Arc<MergeQueue>,
        janitor: Arc<Janitor>,
        config: UploadConfig,
    ) -> Self {
        Self {
            registry,
            chunks,
            validator,
            queue,
            janitor,
            config,
        }
    }

    /// Start a new upload session.
    #[tracing::instrument(skip_all, fields(filename = %req.filename, submitter = %req.submitter))]
    pub async fn initialize(&self, req: InitializeRequest) -> Result<InitializeReceipt> {
        validate_filename(&req.filename)?;
        if !self.validator.is_safe(&req.target_dir).await {
            return Err(EngineError::InvalidRequest(format!(
                "target directory not allowed: {}",
                req.target_dir
            )));
        }

        // Reclaim abandoned sessions before admitting a new one, off the
        // request path. Not a substitute for the periodic janitor loop.
        let janitor = Arc::clone(&self.janitor);
        tokio::spawn(async move {
            if let Err(e) = janitor.sweep_once(OPPORTUNISTIC_SWEEP_LIMIT).await {
                tracing::warn!(error = %e, "opportunistic sweep failed");
            }
        });

        let chunk_size = match req.chunk_size {
            Some(size) if size > 0 => size,
            _ => self.config.default_chunk_size,
        };
        let session = UploadSession::new(
            req.filename,
            req.declared_size,
            req.target_dir,
            req.submitter,
            chunk_size,
        )?;

        self.registry.create_session(&session).await?;
        self.chunks.create_staging(&session.upload_id).await?;

        tracing::info!(
            upload_id = %session.upload_id,
            size = session.declared_size,
            total_chunks = session.total_chunks,
            "upload session created"
        );

        Ok(InitializeReceipt {
            upload_id: session.upload_id,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
        })
    }

    /// Stage one chunk. Chunks may arrive in any order and more than once;
    /// a repeated index overwrites the staged bytes and does not advance the
    /// received count.
    #[tracing::instrument(skip_all, fields(upload_id = %upload_id, index))]
    pub async fn upload_chunk(
        &self,
        upload_id: &UploadId,
        index: u32,
        data: Bytes,
        declared_hash: Option<&ContentHash>,
    ) -> Result<ChunkReceipt> {
        let Some(session) = self.registry.get_session(upload_id).await? else {
            return Err(EngineError::NotFound(upload_id.to_string()));
        };

        match session.status {
            UploadStatus::Cancelled => {
                return Err(EngineError::NotFound(upload_id.to_string()));
            }
            UploadStatus::Merging | UploadStatus::Merged => {
                return Err(EngineError::Conflict(format!(
                    "upload {upload_id} is in state {}",
                    session.status
                )));
            }
            _ => {}
        }

        if !session.contains_index(index) {
            return Err(EngineError::InvalidRequest(format!(
                "chunk index {index} out of range, session has {} chunks",
                session.total_chunks
            )));
        }
        let expected = session
            .expected_chunk_len(index)
            .unwrap_or(session.chunk_size);
        if data.len() as u64 != expected {
            return Err(EngineError::ChunkSizeMismatch {
                index,
                expected,
                actual: data.len() as u64,
            });
        }

        // Integrity is checked before anything touches disk.
        if let Some(declared) = declared_hash {
            let actual = ContentHash::compute(&data);
            if actual != *declared {
                return Err(EngineError::HashMismatch { index });
            }
        }

        self.chunks.write_chunk(upload_id, index, data).await?;
        let progress = self.registry.record_chunk(upload_id, index).await?;

        if progress.completed_now {
            self.queue.enqueue(upload_id.clone()).await;
        }

        Ok(ChunkReceipt {
            received: progress.received,
            total: progress.total,
            all_received: progress.received == progress.total,
        })
    }

    /// Current state of a session, including which chunks are still missing.
    pub async fn status(&self, upload_id: &UploadId) -> Result<StatusReport> {
        let Some(session) = self.registry.get_session(upload_id).await? else {
            return Err(EngineError::NotFound(upload_id.to_string()));
        };
        let received_indices = self.registry.received_indices(upload_id).await?;
        let missing_indices = (0..session.total_chunks as u32)
            .filter(|i| !received_indices.contains(i))
            .collect();
        Ok(StatusReport {
            session,
            received_indices,
            missing_indices,
        })
    }

    /// Cancel a session and discard its staged chunks. Cancelling twice is a
    /// no-op; cancelling a merge in flight or a merged session is a conflict.
    #[tracing::instrument(skip_all, fields(upload_id = %upload_id))]
    pub async fn cancel(&self, upload_id: &UploadId) -> Result<()> {
        match self.registry.cancel_session(upload_id).await? {
            CancelOutcome::Cancelled => {
                if let Err(e) = self.chunks.delete_all(upload_id).await {
                    // Leftovers get picked up by the janitor's terminal sweep.
                    tracing::warn!(upload_id = %upload_id, error = %e, "could not delete staged chunks");
                }
                tracing::info!(upload_id = %upload_id, "upload session cancelled");
                Ok(())
            }
            CancelOutcome::Terminal(UploadStatus::Cancelled) => Ok(()),
            CancelOutcome::Terminal(status) => Err(EngineError::Conflict(format!(
                "upload {upload_id} is already {status}"
            ))),
            CancelOutcome::MergeInProgress => Err(EngineError::Conflict(format!(
                "upload {upload_id} is being merged"
            ))),
            CancelOutcome::NotFound => Err(EngineError::NotFound(upload_id.to_string())),
        }
    }

    /// All known sessions, optionally restricted to one submitter.
    pub async fn list(&self, submitter: Option<&str>) -> Result<Vec<SessionSummary>> {
        let sessions = self.registry.list_sessions(submitter).await?;
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let received = self.registry.received_indices(&session.upload_id).await?;
            summaries.push(SessionSummary {
                received_chunks: received.len() as u64,
                session,
            });
        }
        Ok(summaries)
    }
}

fn validate_filename(filename: &str) -> Result<()> {
    let bad = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0');
    if bad {
        return Err(EngineError::InvalidRequest(format!(
            "invalid filename: {filename:?}"
        )));
    }
    Ok(())
}
