//! Core domain types and shared logic for the Sluice upload engine.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload session identifiers and lifecycle
//! - Chunk-count arithmetic and per-chunk length rules
//! - Content hashing for chunk integrity checks
//! - Configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod upload;

pub use config::{AppConfig, JanitorConfig, RegistryConfig, StagingConfig, UploadConfig};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use upload::{UploadId, UploadSession, UploadStatus};

/// Default chunk size: 4 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum chunk size: 64 MiB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Minimum chunk size: 64 KiB
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// Maximum number of chunks a single session may declare.
///
/// Protects against pathological declared_size/chunk_size combinations that
/// would produce millions of staging files.
pub const MAX_TOTAL_CHUNKS: u64 = 100_000;
