//! Background reclamation of abandoned and finished sessions.

use sluice_core::JanitorConfig;
use sluice_registry::{CancelOutcome, SessionRegistry};
use sluice_store::ChunkStore;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::Result;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    /// Inactive sessions cancelled and their staging reclaimed.
    pub expired_cancelled: u32,
    /// Terminal session records deleted after their retention window.
    pub terminal_purged: u32,
    /// Sessions whose cleanup errored and was skipped this sweep.
    pub failures: u32,
}

/// Periodic sweeper. Expired sessions are cancelled and their staged chunks
/// deleted; terminal records are kept around for status queries until their
/// retention lapses, then purged.
pub struct Janitor {
    registry: Arc<dyn SessionRegistry>,
    chunks: Arc<dyn ChunkStore>,
    config: JanitorConfig,
    session_timeout: Duration,
}

impl Janitor {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        chunks: Arc<dyn ChunkStore>,
        config: JanitorConfig,
        session_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            chunks,
            config,
            session_timeout,
        }
    }

    /// One sweep over both expiry and retention, bounded by `limit` sessions
    /// each.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self, limit: u32) -> Result<SweepStats> {
        let now = OffsetDateTime::now_utc();
        let mut stats = SweepStats::default();

        let expiry_cutoff = now - self.session_timeout - self.config.grace_period();
        for session in self
            .registry
            .get_expired_sessions(expiry_cutoff, limit)
            .await?
        {
            // A session that fails to clean up is skipped, never allowed to
            // wedge the sweep for the sessions behind it.
            match self.registry.cancel_session(&session.upload_id).await {
                Ok(CancelOutcome::Cancelled) => {
                    if let Err(e) = self.chunks.delete_all(&session.upload_id).await {
                        tracing::warn!(
                            upload_id = %session.upload_id,
                            error = %e,
                            "could not delete staged chunks of expired session"
                        );
                    }
                    tracing::info!(
                        upload_id = %session.upload_id,
                        status = %session.status,
                        "expired upload session reclaimed"
                    );
                    stats.expired_cancelled += 1;
                }
                // The session moved on between the query and the cancel.
                Ok(other) => {
                    tracing::debug!(
                        upload_id = %session.upload_id,
                        outcome = ?other,
                        "expired session skipped"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        upload_id = %session.upload_id,
                        error = %e,
                        "could not cancel expired session"
                    );
                    stats.failures += 1;
                }
            }
        }

        let retention_cutoff = now - self.config.terminal_retention();
        for session in self
            .registry
            .get_terminal_sessions(retention_cutoff, limit)
            .await?
        {
            // Staging is normally gone by now; this catches sessions whose
            // cleanup failed earlier.
            if let Err(e) = self.chunks.delete_all(&session.upload_id).await {
                tracing::warn!(
                    upload_id = %session.upload_id,
                    error = %e,
                    "could not delete leftover staging"
                );
            }
            match self.registry.delete_session(&session.upload_id).await {
                Ok(()) => stats.terminal_purged += 1,
                Err(e) => {
                    tracing::warn!(
                        upload_id = %session.upload_id,
                        error = %e,
                        "could not delete terminal session record"
                    );
                    stats.failures += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.config.interval()).await;
                match self.sweep_once(self.config.batch_size).await {
                    Ok(stats)
                        if stats.expired_cancelled > 0
                            || stats.terminal_purged > 0
                            || stats.failures > 0 =>
                    {
                        tracing::info!(
                            expired = stats.expired_cancelled,
                            purged = stats.terminal_purged,
                            failures = stats.failures,
                            "janitor sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "janitor sweep failed"),
                }
            }
        })
    }
}
