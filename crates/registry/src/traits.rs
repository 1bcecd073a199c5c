//! Session registry abstraction.

use async_trait::async_trait;
use sluice_core::{UploadId, UploadSession, UploadStatus};
use std::collections::BTreeSet;
use time::OffsetDateTime;

use crate::error::Result;

/// Chunk bookkeeping result, observed atomically with the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Distinct chunks recorded so far.
    pub received: u64,
    /// Chunks the session declared.
    pub total: u64,
    /// True for exactly one call per session: the one whose write moved the
    /// session to AllReceived.
    pub completed_now: bool,
}

/// Result of attempting to claim a session for merging.
#[derive(Debug, Clone)]
pub struct MergeClaim {
    /// True if this call performed the transition to Merging.
    pub acquired: bool,
    /// The session as of just after the attempt.
    pub session: UploadSession,
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Session is mid-merge and cannot be cancelled right now.
    MergeInProgress,
    /// Session already reached a terminal state.
    Terminal(UploadStatus),
    NotFound,
}

/// Authoritative record of upload sessions and which chunks have arrived.
///
/// All state transitions are conditional on the current status, so concurrent
/// callers racing on the same session resolve to exactly one winner.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn create_session(&self, session: &UploadSession) -> Result<()>;

    async fn get_session(&self, upload_id: &UploadId) -> Result<Option<UploadSession>>;

    /// All sessions, optionally filtered by submitter, newest first.
    async fn list_sessions(&self, submitter: Option<&str>) -> Result<Vec<UploadSession>>;

    /// Record that a chunk arrived. Duplicate indices are ignored. The
    /// returned progress reflects the state inside the same transaction, so
    /// exactly one concurrent caller observes `completed_now`.
    async fn record_chunk(&self, upload_id: &UploadId, index: u32) -> Result<ChunkProgress>;

    async fn received_indices(&self, upload_id: &UploadId) -> Result<BTreeSet<u32>>;

    /// Try to move the session from AllReceived or Failed into Merging.
    async fn begin_merge(&self, upload_id: &UploadId) -> Result<Option<MergeClaim>>;

    /// Merging -> Merged, recording the merged file's location.
    async fn complete_merge(&self, upload_id: &UploadId, final_path: &str) -> Result<()>;

    /// Merging -> Failed, recording why.
    async fn fail_session(
        &self,
        upload_id: &UploadId,
        error_code: &str,
        error_detail: &str,
    ) -> Result<()>;

    async fn cancel_session(&self, upload_id: &UploadId) -> Result<CancelOutcome>;

    /// Non-terminal sessions with no activity since `cutoff`. Never returns
    /// sessions that are currently Merging.
    async fn get_expired_sessions(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<UploadSession>>;

    /// Terminal sessions whose records are old enough to delete.
    async fn get_terminal_sessions(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<UploadSession>>;

    /// Remove the session row and its chunk bookkeeping.
    async fn delete_session(&self, upload_id: &UploadId) -> Result<()>;
}
