//! Composition root wiring the registry, chunk store, merge pipeline, and
//! janitor together.

use sluice_core::AppConfig;
use sluice_registry::{SessionRegistry, SqliteRegistry};
use sluice_store::{ChunkStore, FilesystemChunkStore};
use std::sync::Arc;

use crate::collaborators::{DirectoryCache, MetadataStore, PathValidator};
use crate::coordinator::UploadCoordinator;
use crate::error::{EngineError, Result};
use crate::janitor::Janitor;
use crate::merge::{MergeQueue, Merger};

pub struct UploadService {
    pub coordinator: Arc<UploadCoordinator>,
    pub janitor: Arc<Janitor>,
}

impl UploadService {
    pub async fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<dyn DirectoryCache>,
        validator: Arc<dyn PathValidator>,
    ) -> Result<Self> {
        config.validate().map_err(EngineError::Config)?;

        let registry: Arc<dyn SessionRegistry> =
            Arc::new(SqliteRegistry::new(&config.registry.db_path).await?);
        let chunks: Arc<dyn ChunkStore> =
            Arc::new(FilesystemChunkStore::new(&config.staging.root).await?);

        let merger = Arc::new(Merger::new(
            Arc::clone(&registry),
            Arc::clone(&chunks),
            metadata,
            cache,
            config.upload.clone(),
        ));
        let queue = Arc::new(MergeQueue::new(merger, config.upload.merge_workers));
        let janitor = Arc::new(Janitor::new(
            Arc::clone(&registry),
            Arc::clone(&chunks),
            config.janitor.clone(),
            config.upload.session_timeout(),
        ));
        let coordinator = Arc::new(UploadCoordinator::new(
            registry,
            chunks,
            validator,
            queue,
            Arc::clone(&janitor),
            config.upload.clone(),
        ));

        Ok(Self { coordinator, janitor })
    }

    /// Start the periodic janitor loop.
    pub fn start_janitor(&self) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.janitor).spawn()
    }
}

/// Install the default tracing subscriber, honoring `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
