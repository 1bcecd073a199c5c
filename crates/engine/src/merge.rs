//! Merge execution: assembling staged chunks into the final file.
//!
//! Exactly-once behavior rests on two layers. The `MergeQueue` deduplicates
//! enqueues per upload, and `begin_merge` in the registry only lets one
//! caller transition a session into Merging. A worker that loses the claim
//! waits on the winner instead of merging again.

use sluice_core::{ContentHash, UploadConfig, UploadId, UploadSession, UploadStatus};
use sluice_registry::SessionRegistry;
use sluice_store::ChunkStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Mutex, Semaphore};
use uuid::Uuid;

use crate::collaborators::{DirectoryCache, FileRecord, MetadataStore};
use crate::error::{EngineError, Result};

const QUEUE_CAPACITY: usize = 1024;
const MAX_NAME_ATTEMPTS: u32 = 10_000;

pub struct Merger {
    registry: Arc<dyn SessionRegistry>,
    chunks: Arc<dyn ChunkStore>,
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<dyn DirectoryCache>,
    config: UploadConfig,
}

impl Merger {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        chunks: Arc<dyn ChunkStore>,
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<dyn DirectoryCache>,
        config: UploadConfig,
    ) -> Self {
        Self {
            registry,
            chunks,
            metadata,
            cache,
            config,
        }
    }

    /// Merge the session's chunks into its destination, returning the final
    /// path. Safe to call repeatedly and from multiple tasks: one caller does
    /// the work, the rest wait for its outcome.
    #[tracing::instrument(skip_all, fields(upload_id = %upload_id))]
    pub async fn merge(&self, upload_id: &UploadId) -> Result<String> {
        let Some(claim) = self.registry.begin_merge(upload_id).await? else {
            return Err(EngineError::NotFound(upload_id.to_string()));
        };

        if !claim.acquired {
            return self.await_other_merge(upload_id, claim.session.status).await;
        }

        match self.run_merge(&claim.session).await {
            Ok(final_path) => Ok(final_path),
            Err(e) => {
                let code = merge_error_code(&e);
                if let Err(fail_err) = self
                    .registry
                    .fail_session(upload_id, code, &e.to_string())
                    .await
                {
                    tracing::error!(
                        upload_id = %upload_id,
                        error = %fail_err,
                        "could not record merge failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Another worker holds the merge. Wait out the poll budget for its
    /// outcome.
    async fn await_other_merge(
        &self,
        upload_id: &UploadId,
        status: UploadStatus,
    ) -> Result<String> {
        match status {
            UploadStatus::Merged => {
                return self.merged_path(upload_id).await;
            }
            UploadStatus::Merging => {}
            other => {
                return Err(EngineError::Conflict(format!(
                    "upload {upload_id} is in state {other}, not ready to merge"
                )));
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.merge_wait_budget();
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::MergeTimeout(upload_id.to_string()));
            }
            tokio::time::sleep(self.config.merge_poll_interval()).await;

            let Some(session) = self.registry.get_session(upload_id).await? else {
                return Err(EngineError::NotFound(upload_id.to_string()));
            };
            match session.status {
                UploadStatus::Merging => continue,
                UploadStatus::Merged => return self.merged_path(upload_id).await,
                UploadStatus::Failed => {
                    return Err(EngineError::Conflict(format!(
                        "merge of upload {upload_id} failed: {}",
                        session.error_detail.unwrap_or_default()
                    )));
                }
                other => {
                    return Err(EngineError::Conflict(format!(
                        "upload {upload_id} moved to unexpected state {other}"
                    )));
                }
            }
        }
    }

    async fn merged_path(&self, upload_id: &UploadId) -> Result<String> {
        let Some(session) = self.registry.get_session(upload_id).await? else {
            return Err(EngineError::NotFound(upload_id.to_string()));
        };
        session.final_path.ok_or_else(|| {
            EngineError::Conflict(format!("upload {upload_id} is merged but has no final path"))
        })
    }

    /// The actual merge. Caller owns the Merging claim.
    async fn run_merge(&self, session: &UploadSession) -> Result<String> {
        let upload_id = &session.upload_id;

        self.verify_staged(session).await?;

        let target_dir = Path::new(&session.target_dir);
        fs::create_dir_all(target_dir).await?;
        let final_path = reserve_destination(target_dir, &session.filename).await?;
        let tmp_path = target_dir.join(format!(".tmp.{}", Uuid::new_v4()));

        let outcome = self.write_merged(session, &tmp_path).await;
        let (written, hash) = match outcome {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                let _ = fs::remove_file(&final_path).await;
                return Err(e);
            }
        };

        if written != session.declared_size {
            let _ = fs::remove_file(&tmp_path).await;
            let _ = fs::remove_file(&final_path).await;
            return Err(EngineError::SizeMismatch {
                upload_id: upload_id.to_string(),
                declared: session.declared_size,
                actual: written,
            });
        }

        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            let _ = fs::remove_file(&final_path).await;
            return Err(e.into());
        }

        let final_path_str = final_path.to_string_lossy().into_owned();
        let record = FileRecord {
            path: final_path_str.clone(),
            size: written,
            content_hash: hash,
            submitter: session.submitter.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.metadata.save_file_record(&record).await {
            // Roll the file back so a retry starts clean.
            let _ = fs::remove_file(&final_path).await;
            return Err(EngineError::Metadata(e.to_string()));
        }

        self.cache.invalidate(&session.target_dir).await;
        self.registry
            .complete_merge(upload_id, &final_path_str)
            .await?;

        if let Err(e) = self.chunks.delete_all(upload_id).await {
            tracing::warn!(upload_id = %upload_id, error = %e, "could not delete staged chunks");
        }

        tracing::info!(
            upload_id = %upload_id,
            path = %final_path_str,
            size = written,
            hash = %hash,
            "merge complete"
        );
        Ok(final_path_str)
    }

    /// Check every declared chunk is actually staged. Staged chunks are left
    /// in place on failure so the client can re-send just the missing ones.
    async fn verify_staged(&self, session: &UploadSession) -> Result<()> {
        let staged = self.chunks.list_indices(&session.upload_id).await?;
        let missing: Vec<u32> = (0..session.total_chunks as u32)
            .filter(|i| !staged.contains(i))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let recorded = self.registry.received_indices(&session.upload_id).await?;
        for index in &missing {
            if recorded.contains(index) {
                tracing::error!(
                    upload_id = %session.upload_id,
                    index,
                    "chunk recorded in registry but absent from staging"
                );
            }
        }
        Err(EngineError::MissingChunks {
            upload_id: session.upload_id.to_string(),
            missing,
        })
    }

    /// Stream chunks in index order into `tmp_path`, hashing as we go.
    async fn write_merged(
        &self,
        session: &UploadSession,
        tmp_path: &Path,
    ) -> Result<(u64, ContentHash)> {
        let buffer_size = if session.declared_size >= self.config.large_file_threshold {
            self.config.large_merge_buffer_size
        } else {
            self.config.merge_buffer_size
        };

        let file = fs::File::create(tmp_path).await?;
        let mut writer = BufWriter::with_capacity(buffer_size, file);
        let mut hasher = ContentHash::hasher();
        let mut written = 0u64;

        for index in 0..session.total_chunks as u32 {
            let data = self.chunks.read_chunk(&session.upload_id, index).await?;
            hasher.update(&data);
            writer.write_all(&data).await?;
            written += data.len() as u64;
        }

        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;

        Ok((written, hasher.finalize()))
    }
}

fn merge_error_code(e: &EngineError) -> &'static str {
    match e {
        EngineError::MissingChunks { .. } => "missing_chunks",
        EngineError::SizeMismatch { .. } => "size_mismatch",
        EngineError::Metadata(_) => "metadata_error",
        EngineError::Store(_) => "storage_error",
        EngineError::Io(_) => "io_error",
        _ => "merge_error",
    }
}

/// Claim a destination filename, appending `_1`, `_2`, ... before the
/// extension until a free name is found. The claim is an exclusive create,
/// so concurrent merges into the same directory never pick the same name.
async fn reserve_destination(dir: &Path, filename: &str) -> Result<PathBuf> {
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy().into_owned());

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            filename.to_string()
        } else {
            match &ext {
                Some(ext) => format!("{stem}_{attempt}.{ext}"),
                None => format!("{stem}_{attempt}"),
            }
        };
        let candidate = dir.join(&name);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(EngineError::Conflict(format!(
        "no free destination name for {filename} in {}",
        dir.display()
    )))
}

/// Bounded merge worker pool with per-upload deduplication.
pub struct MergeQueue {
    tx: mpsc::Sender<UploadId>,
    inflight: Arc<Mutex<HashSet<UploadId>>>,
}

impl MergeQueue {
    /// Spawn the dispatcher. At most `workers` merges run at once.
    pub fn new(merger: Arc<Merger>, workers: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<UploadId>(QUEUE_CAPACITY);
        let inflight: Arc<Mutex<HashSet<UploadId>>> = Arc::default();
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));

        let dispatcher_inflight = Arc::clone(&inflight);
        tokio::spawn(async move {
            while let Some(upload_id) = rx.recv().await {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let merger = Arc::clone(&merger);
                let inflight = Arc::clone(&dispatcher_inflight);
                tokio::spawn(async move {
                    let result = merger.merge(&upload_id).await;
                    inflight.lock().await.remove(&upload_id);
                    if let Err(e) = result {
                        tracing::error!(upload_id = %upload_id, error = %e, "queued merge failed");
                    }
                    drop(permit);
                });
            }
        });

        Self { tx, inflight }
    }

    /// Queue a merge. Returns false if one is already queued or running for
    /// this upload.
    pub async fn enqueue(&self, upload_id: UploadId) -> bool {
        {
            let mut inflight = self.inflight.lock().await;
            if !inflight.insert(upload_id.clone()) {
                return false;
            }
        }
        if self.tx.send(upload_id.clone()).await.is_err() {
            self.inflight.lock().await.remove(&upload_id);
            tracing::error!(upload_id = %upload_id, "merge queue is closed");
            return false;
        }
        true
    }
}
