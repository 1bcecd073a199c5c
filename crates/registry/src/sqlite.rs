//! SQLite-backed session registry.
//!
//! The pool is limited to a single connection so every operation's
//! transaction is fully serialized. State transitions are guarded UPDATEs
//! whose `rows_affected` tells the caller whether it won the transition.

use async_trait::async_trait;
use sluice_core::{UploadId, UploadSession, UploadStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::{RegistryError, Result};
use crate::models::SessionRow;
use crate::traits::{CancelOutcome, ChunkProgress, MergeClaim, SessionRegistry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS upload_sessions (
    upload_id     TEXT PRIMARY KEY,
    filename      TEXT NOT NULL,
    declared_size INTEGER NOT NULL,
    target_dir    TEXT NOT NULL,
    submitter     TEXT NOT NULL,
    chunk_size    INTEGER NOT NULL,
    total_chunks  INTEGER NOT NULL,
    status        TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    final_path    TEXT,
    error_code    TEXT,
    error_detail  TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON upload_sessions (status);
CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON upload_sessions (updated_at);
CREATE INDEX IF NOT EXISTS idx_sessions_submitter ON upload_sessions (submitter);

CREATE TABLE IF NOT EXISTS received_chunks (
    upload_id   TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    received_at INTEGER NOT NULL,
    PRIMARY KEY (upload_id, chunk_index)
);
"#;

pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RegistryError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // One connection keeps all transactions serialized.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionRegistry for SqliteRegistry {
    async fn create_session(&self, session: &UploadSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO upload_sessions \
             (upload_id, filename, declared_size, target_dir, submitter, chunk_size, \
              total_chunks, status, created_at, updated_at, final_path, error_code, error_detail) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL)",
        )
        .bind(session.upload_id.as_str())
        .bind(&session.filename)
        .bind(session.declared_size as i64)
        .bind(&session.target_dir)
        .bind(&session.submitter)
        .bind(session.chunk_size as i64)
        .bind(session.total_chunks as i64)
        .bind(session.status.as_str())
        .bind(session.created_at.unix_timestamp())
        .bind(session.updated_at.unix_timestamp())
        .execute(&self.pool)
        .await?;
        tracing::debug!(
            upload_id = %session.upload_id,
            total_chunks = session.total_chunks,
            "session row created"
        );
        Ok(())
    }

    async fn get_session(&self, upload_id: &UploadId) -> Result<Option<UploadSession>> {
        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.map(SessionRow::into_session).transpose()
    }

    async fn list_sessions(&self, submitter: Option<&str>) -> Result<Vec<UploadSession>> {
        let rows: Vec<SessionRow> = match submitter {
            Some(submitter) => {
                sqlx::query_as(
                    "SELECT * FROM upload_sessions WHERE submitter = ? \
                     ORDER BY created_at DESC",
                )
                .bind(submitter)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM upload_sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    async fn record_chunk(&self, upload_id: &UploadId, index: u32) -> Result<ChunkProgress> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT status, total_chunks FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((status, total)) = row else {
            return Err(RegistryError::NotFound(upload_id.to_string()));
        };
        let status = UploadStatus::parse(&status)?;
        if !status.accepts_chunks() {
            return Err(RegistryError::InvalidState {
                upload_id: upload_id.to_string(),
                status: status.to_string(),
            });
        }

        sqlx::query(
            "INSERT OR IGNORE INTO received_chunks (upload_id, chunk_index, received_at) \
             VALUES (?, ?, ?)",
        )
        .bind(upload_id.as_str())
        .bind(i64::from(index))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let received: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM received_chunks WHERE upload_id = ?")
                .bind(upload_id.as_str())
                .fetch_one(&mut *tx)
                .await?;

        let completed_now = if received == total {
            // The one caller whose guarded update fires owns completion. A
            // Failed session re-completing here re-arms the merge.
            let res = sqlx::query(
                "UPDATE upload_sessions SET status = 'all_received', updated_at = ? \
                 WHERE upload_id = ? AND status IN ('initialized', 'in_progress', 'failed')",
            )
            .bind(now)
            .bind(upload_id.as_str())
            .execute(&mut *tx)
            .await?;
            res.rows_affected() == 1
        } else {
            sqlx::query(
                "UPDATE upload_sessions SET updated_at = ?, \
                 status = CASE WHEN status = 'initialized' THEN 'in_progress' ELSE status END \
                 WHERE upload_id = ?",
            )
            .bind(now)
            .bind(upload_id.as_str())
            .execute(&mut *tx)
            .await?;
            false
        };

        tx.commit().await?;

        if completed_now {
            tracing::debug!(upload_id = %upload_id, total, "all chunks recorded");
        }

        Ok(ChunkProgress {
            received: received as u64,
            total: total as u64,
            completed_now,
        })
    }

    async fn received_indices(&self, upload_id: &UploadId) -> Result<BTreeSet<u32>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT chunk_index FROM received_chunks WHERE upload_id = ? ORDER BY chunk_index",
        )
        .bind(upload_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(i,)| i as u32).collect())
    }

    async fn begin_merge(&self, upload_id: &UploadId) -> Result<Option<MergeClaim>> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            "UPDATE upload_sessions SET status = 'merging', updated_at = ? \
             WHERE upload_id = ? AND status IN ('all_received', 'failed')",
        )
        .bind(now)
        .bind(upload_id.as_str())
        .execute(&mut *tx)
        .await?;
        let acquired = res.rows_affected() == 1;

        let row: Option<SessionRow> =
            sqlx::query_as("SELECT * FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        tx.commit().await?;

        tracing::debug!(upload_id = %upload_id, acquired, "merge claim attempted");
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(MergeClaim {
                acquired,
                session: row.into_session()?,
            })),
        }
    }

    async fn complete_merge(&self, upload_id: &UploadId, final_path: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let res = sqlx::query(
            "UPDATE upload_sessions SET status = 'merged', final_path = ?, \
             error_code = NULL, error_detail = NULL, updated_at = ? \
             WHERE upload_id = ? AND status = 'merging'",
        )
        .bind(final_path)
        .bind(now)
        .bind(upload_id.as_str())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_conflict(upload_id).await);
        }
        tracing::debug!(upload_id = %upload_id, final_path, "session merged");
        Ok(())
    }

    async fn fail_session(
        &self,
        upload_id: &UploadId,
        error_code: &str,
        error_detail: &str,
    ) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let res = sqlx::query(
            "UPDATE upload_sessions SET status = 'failed', error_code = ?, error_detail = ?, \
             updated_at = ? WHERE upload_id = ? AND status = 'merging'",
        )
        .bind(error_code)
        .bind(error_detail)
        .bind(now)
        .bind(upload_id.as_str())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_conflict(upload_id).await);
        }
        tracing::warn!(upload_id = %upload_id, code = error_code, "session marked failed");
        Ok(())
    }

    async fn cancel_session(&self, upload_id: &UploadId) -> Result<CancelOutcome> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(status) = status else {
            return Ok(CancelOutcome::NotFound);
        };
        let status = UploadStatus::parse(&status)?;

        if status == UploadStatus::Merging {
            return Ok(CancelOutcome::MergeInProgress);
        }
        if status.is_terminal() {
            return Ok(CancelOutcome::Terminal(status));
        }

        sqlx::query(
            "UPDATE upload_sessions SET status = 'cancelled', updated_at = ? WHERE upload_id = ?",
        )
        .bind(now)
        .bind(upload_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(upload_id = %upload_id, "session cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    async fn get_expired_sessions(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<UploadSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM upload_sessions \
             WHERE updated_at < ? AND status NOT IN ('merging', 'merged', 'cancelled') \
             ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(cutoff.unix_timestamp())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    async fn get_terminal_sessions(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<UploadSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM upload_sessions \
             WHERE updated_at < ? AND status IN ('merged', 'cancelled') \
             ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(cutoff.unix_timestamp())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    async fn delete_session(&self, upload_id: &UploadId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM received_chunks WHERE upload_id = ?")
            .bind(upload_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

impl SqliteRegistry {
    /// Build the InvalidState error for a guarded UPDATE that matched no row.
    async fn transition_conflict(&self, upload_id: &UploadId) -> RegistryError {
        let status: Option<String> =
            match sqlx::query_scalar("SELECT status FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id.as_str())
                .fetch_optional(&self.pool)
                .await
            {
                Ok(status) => status,
                Err(e) => return RegistryError::Database(e),
            };
        match status {
            None => RegistryError::NotFound(upload_id.to_string()),
            Some(status) => RegistryError::InvalidState {
                upload_id: upload_id.to_string(),
                status,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn registry() -> (tempfile::TempDir, SqliteRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = SqliteRegistry::new(dir.path().join("registry.db"))
            .await
            .unwrap();
        (dir, reg)
    }

    fn session(total_chunks: u64) -> UploadSession {
        UploadSession::new(
            "data.bin".into(),
            total_chunks * sluice_core::MIN_CHUNK_SIZE,
            "/dst".into(),
            "alice".into(),
            sluice_core::MIN_CHUNK_SIZE,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_dir, reg) = registry().await;
        let s = session(3);
        reg.create_session(&s).await.unwrap();

        let got = reg.get_session(&s.upload_id).await.unwrap().unwrap();
        assert_eq!(got.filename, "data.bin");
        assert_eq!(got.total_chunks, 3);
        assert_eq!(got.status, UploadStatus::Initialized);
        assert!(got.final_path.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_dir, reg) = registry().await;
        let s = session(1);
        assert!(reg.get_session(&s.upload_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_chunk_progress() {
        let (_dir, reg) = registry().await;
        let s = session(3);
        reg.create_session(&s).await.unwrap();

        let p = reg.record_chunk(&s.upload_id, 1).await.unwrap();
        assert_eq!((p.received, p.total, p.completed_now), (1, 3, false));

        // Duplicate delivery does not advance the count.
        let p = reg.record_chunk(&s.upload_id, 1).await.unwrap();
        assert_eq!((p.received, p.completed_now), (1, false));

        reg.record_chunk(&s.upload_id, 0).await.unwrap();
        let p = reg.record_chunk(&s.upload_id, 2).await.unwrap();
        assert_eq!((p.received, p.completed_now), (3, true));

        let got = reg.get_session(&s.upload_id).await.unwrap().unwrap();
        assert_eq!(got.status, UploadStatus::AllReceived);
    }

    #[tokio::test]
    async fn test_completed_now_observed_once_under_races() {
        let (_dir, reg) = registry().await;
        let reg = Arc::new(reg);
        let s = session(2);
        reg.create_session(&s).await.unwrap();
        reg.record_chunk(&s.upload_id, 0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            let id = s.upload_id.clone();
            handles.push(tokio::spawn(
                async move { reg.record_chunk(&id, 1).await },
            ));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().unwrap().completed_now {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_record_chunk_rejected_after_cancel() {
        let (_dir, reg) = registry().await;
        let s = session(2);
        reg.create_session(&s).await.unwrap();
        assert_eq!(
            reg.cancel_session(&s.upload_id).await.unwrap(),
            CancelOutcome::Cancelled
        );

        let err = reg.record_chunk(&s.upload_id, 0).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_begin_merge_single_winner() {
        let (_dir, reg) = registry().await;
        let s = session(1);
        reg.create_session(&s).await.unwrap();
        reg.record_chunk(&s.upload_id, 0).await.unwrap();

        let first = reg.begin_merge(&s.upload_id).await.unwrap().unwrap();
        assert!(first.acquired);
        assert_eq!(first.session.status, UploadStatus::Merging);

        let second = reg.begin_merge(&s.upload_id).await.unwrap().unwrap();
        assert!(!second.acquired);
        assert_eq!(second.session.status, UploadStatus::Merging);
    }

    #[tokio::test]
    async fn test_merge_lifecycle_success_and_retry() {
        let (_dir, reg) = registry().await;
        let s = session(1);
        reg.create_session(&s).await.unwrap();
        reg.record_chunk(&s.upload_id, 0).await.unwrap();

        let claim = reg.begin_merge(&s.upload_id).await.unwrap().unwrap();
        assert!(claim.acquired);
        reg.fail_session(&s.upload_id, "missing_chunks", "chunk 0 vanished")
            .await
            .unwrap();

        let got = reg.get_session(&s.upload_id).await.unwrap().unwrap();
        assert_eq!(got.status, UploadStatus::Failed);
        assert_eq!(got.error_code.as_deref(), Some("missing_chunks"));

        // Failed sessions can be claimed again.
        let retry = reg.begin_merge(&s.upload_id).await.unwrap().unwrap();
        assert!(retry.acquired);
        reg.complete_merge(&s.upload_id, "/dst/data.bin").await.unwrap();

        let got = reg.get_session(&s.upload_id).await.unwrap().unwrap();
        assert_eq!(got.status, UploadStatus::Merged);
        assert_eq!(got.final_path.as_deref(), Some("/dst/data.bin"));
        assert!(got.error_code.is_none());
    }

    #[tokio::test]
    async fn test_begin_merge_requires_completion_or_failure() {
        let (_dir, reg) = registry().await;
        let s = session(2);
        reg.create_session(&s).await.unwrap();
        reg.record_chunk(&s.upload_id, 0).await.unwrap();

        let claim = reg.begin_merge(&s.upload_id).await.unwrap().unwrap();
        assert!(!claim.acquired);
        assert_eq!(claim.session.status, UploadStatus::InProgress);
    }

    #[tokio::test]
    async fn test_cancel_outcomes() {
        let (_dir, reg) = registry().await;
        let s = session(1);
        reg.create_session(&s).await.unwrap();
        reg.record_chunk(&s.upload_id, 0).await.unwrap();
        reg.begin_merge(&s.upload_id).await.unwrap();

        assert_eq!(
            reg.cancel_session(&s.upload_id).await.unwrap(),
            CancelOutcome::MergeInProgress
        );

        reg.complete_merge(&s.upload_id, "/dst/data.bin").await.unwrap();
        assert_eq!(
            reg.cancel_session(&s.upload_id).await.unwrap(),
            CancelOutcome::Terminal(UploadStatus::Merged)
        );

        let other = session(1);
        assert_eq!(
            reg.cancel_session(&other.upload_id).await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_expired_sessions_exclude_merging_and_terminal() {
        let (_dir, reg) = registry().await;
        let idle = session(2);
        reg.create_session(&idle).await.unwrap();

        let merging = session(1);
        reg.create_session(&merging).await.unwrap();
        reg.record_chunk(&merging.upload_id, 0).await.unwrap();
        reg.begin_merge(&merging.upload_id).await.unwrap();

        let cancelled = session(2);
        reg.create_session(&cancelled).await.unwrap();
        reg.cancel_session(&cancelled.upload_id).await.unwrap();

        let future = OffsetDateTime::now_utc() + time::Duration::hours(1);
        let expired = reg.get_expired_sessions(future, 10).await.unwrap();
        let ids: Vec<_> = expired.iter().map(|s| s.upload_id.clone()).collect();
        assert_eq!(ids, vec![idle.upload_id]);

        let terminal = reg.get_terminal_sessions(future, 10).await.unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].upload_id, cancelled.upload_id);
    }

    #[tokio::test]
    async fn test_delete_session_removes_chunk_rows() {
        let (_dir, reg) = registry().await;
        let s = session(2);
        reg.create_session(&s).await.unwrap();
        reg.record_chunk(&s.upload_id, 0).await.unwrap();

        reg.delete_session(&s.upload_id).await.unwrap();
        assert!(reg.get_session(&s.upload_id).await.unwrap().is_none());
        assert!(reg.received_indices(&s.upload_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_sessions_filters_by_submitter() {
        let (_dir, reg) = registry().await;
        let a = session(1);
        reg.create_session(&a).await.unwrap();
        let mut b = session(1);
        b.submitter = "bob".into();
        reg.create_session(&b).await.unwrap();

        assert_eq!(reg.list_sessions(None).await.unwrap().len(), 2);
        let bobs = reg.list_sessions(Some("bob")).await.unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].submitter, "bob");
    }
}
