#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use sluice_core::{AppConfig, UploadId, UploadSession, UploadStatus};
use sluice_engine::{
    FileRecord, MetadataStore, NoopDirectoryCache, RootedPathValidator, UploadCoordinator,
    UploadService,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Everything a test needs: a service wired against temp directories, plus
/// the paths to poke at from outside.
pub struct Harness {
    pub dir: TempDir,
    pub service: UploadService,
    pub metadata: Arc<RecordingMetadataStore>,
    pub dest: PathBuf,
    pub staging: PathBuf,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let metadata = Arc::new(RecordingMetadataStore::default());
        Self::build(tweak, Arc::clone(&metadata) as Arc<dyn MetadataStore>, metadata).await
    }

    pub async fn with_metadata(store: Arc<dyn MetadataStore>) -> Self {
        Self::build(|_| {}, store, Arc::new(RecordingMetadataStore::default())).await
    }

    async fn build(
        tweak: impl FnOnce(&mut AppConfig),
        store: Arc<dyn MetadataStore>,
        metadata: Arc<RecordingMetadataStore>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();

        let mut config = AppConfig::for_testing(staging.clone(), dir.path().join("registry.db"));
        // Keep finished session records around unless a test opts out.
        config.janitor.terminal_retention_secs = 3600;
        tweak(&mut config);

        let validator = Arc::new(RootedPathValidator::new(vec![dest.clone()]));
        let service = UploadService::new(config, store, Arc::new(NoopDirectoryCache), validator)
            .await
            .unwrap();

        Self {
            dir,
            service,
            metadata,
            dest,
            staging,
        }
    }

    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.service.coordinator
    }

    pub fn dest_str(&self) -> String {
        self.dest.to_string_lossy().into_owned()
    }

    /// Path of the staged chunk file for direct sabotage.
    pub fn chunk_file(&self, upload_id: &UploadId, index: u32) -> PathBuf {
        self.staging
            .join(upload_id.as_str())
            .join(format!("chunk_{index}"))
    }
}

/// Catalog stub that remembers every record it is handed.
#[derive(Default)]
pub struct RecordingMetadataStore {
    pub records: Mutex<Vec<FileRecord>>,
}

#[async_trait]
impl MetadataStore for RecordingMetadataStore {
    async fn save_file_record(&self, record: &FileRecord) -> sluice_engine::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn delete_file_record(&self, _path: &str) -> sluice_engine::Result<()> {
        Ok(())
    }
}

/// Catalog stub that stalls, holding sessions in Merging long enough for a
/// test to observe the state.
pub struct SlowMetadataStore {
    pub delay: Duration,
}

#[async_trait]
impl MetadataStore for SlowMetadataStore {
    async fn save_file_record(&self, _record: &FileRecord) -> sluice_engine::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn delete_file_record(&self, _path: &str) -> sluice_engine::Result<()> {
        Ok(())
    }
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

pub fn chunks_of(data: &[u8], chunk_size: u64) -> Vec<Bytes> {
    data.chunks(chunk_size as usize)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Poll a session until `pred` holds, panicking after five seconds.
pub async fn wait_for(
    coordinator: &UploadCoordinator,
    upload_id: &UploadId,
    pred: impl Fn(&UploadSession) -> bool,
) -> UploadSession {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let report = coordinator.status(upload_id).await.unwrap();
        if pred(&report.session) {
            return report.session;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "session {upload_id} stuck in {:?} past deadline",
                report.session.status
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_merged(coordinator: &UploadCoordinator, upload_id: &UploadId) -> UploadSession {
    wait_for(coordinator, upload_id, |s| {
        assert_ne!(s.status, UploadStatus::Failed, "merge failed unexpectedly");
        s.status == UploadStatus::Merged
    })
    .await
}
