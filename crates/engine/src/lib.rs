//! Sluice: chunked, resumable upload engine.
//!
//! Files arrive as fixed-size chunks, in any order and over any number of
//! connections. Each upload is tracked as a session in a registry; once all
//! chunks are staged, a background worker merges them into the destination
//! file exactly once, verifies the result, and notifies the surrounding
//! application.

pub mod collaborators;
pub mod coordinator;
pub mod error;
pub mod janitor;
pub mod merge;
pub mod service;

pub use collaborators::{
    DirectoryCache, FileRecord, MetadataStore, NoopDirectoryCache, NoopMetadataStore,
    PathValidator, RootedPathValidator,
};
pub use coordinator::{
    ChunkReceipt, InitializeReceipt, InitializeRequest, SessionSummary, StatusReport,
    UploadCoordinator,
};
pub use error::{EngineError, Result};
pub use janitor::{Janitor, SweepStats};
pub use merge::{MergeQueue, Merger};
pub use service::{init_tracing, UploadService};
