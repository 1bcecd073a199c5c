//! Configuration for the upload engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_TOTAL_CHUNKS, MIN_CHUNK_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.upload.validate()?;
        self.janitor.validate()?;
        if self.staging.root.as_os_str().is_empty() {
            return Err("staging.root must not be empty".to_string());
        }
        if self.registry.db_path.as_os_str().is_empty() {
            return Err("registry.db_path must not be empty".to_string());
        }
        Ok(())
    }

    /// Configuration suitable for tests: small intervals, temp-friendly paths.
    pub fn for_testing(staging_root: PathBuf, db_path: PathBuf) -> Self {
        Self {
            upload: UploadConfig {
                session_timeout_secs: 60,
                merge_workers: 2,
                merge_poll_interval_ms: 10,
                merge_wait_budget_ms: 2_000,
                ..UploadConfig::default()
            },
            janitor: JanitorConfig {
                interval_secs: 1,
                grace_period_secs: 0,
                batch_size: 50,
                terminal_retention_secs: 0,
            },
            staging: StagingConfig { root: staging_root },
            registry: RegistryConfig { db_path },
        }
    }
}

/// Chunked upload behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Chunk size used when the client does not request one.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,

    /// Seconds of inactivity after which a session is considered expired.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Maximum number of merges running concurrently.
    #[serde(default = "default_merge_workers")]
    pub merge_workers: usize,

    /// Poll interval while waiting on a merge held by another worker.
    #[serde(default = "default_merge_poll_interval_ms")]
    pub merge_poll_interval_ms: u64,

    /// Total time to wait on a merge held by another worker before giving up.
    #[serde(default = "default_merge_wait_budget_ms")]
    pub merge_wait_budget_ms: u64,

    /// Files at or above this size are merged through a larger write buffer.
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    /// Write buffer size for small merges.
    #[serde(default = "default_merge_buffer_size")]
    pub merge_buffer_size: usize,

    /// Write buffer size for merges at or above `large_file_threshold`.
    #[serde(default = "default_large_merge_buffer_size")]
    pub large_merge_buffer_size: usize,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_session_timeout() -> u64 {
    24 * 60 * 60
}

fn default_merge_workers() -> usize {
    4
}

fn default_merge_poll_interval_ms() -> u64 {
    100
}

fn default_merge_wait_budget_ms() -> u64 {
    10_000
}

fn default_large_file_threshold() -> u64 {
    256 * 1024 * 1024
}

fn default_merge_buffer_size() -> usize {
    256 * 1024
}

fn default_large_merge_buffer_size() -> usize {
    4 * 1024 * 1024
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            session_timeout_secs: default_session_timeout(),
            merge_workers: default_merge_workers(),
            merge_poll_interval_ms: default_merge_poll_interval_ms(),
            merge_wait_budget_ms: default_merge_wait_budget_ms(),
            large_file_threshold: default_large_file_threshold(),
            merge_buffer_size: default_merge_buffer_size(),
            large_merge_buffer_size: default_large_merge_buffer_size(),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.default_chunk_size < MIN_CHUNK_SIZE || self.default_chunk_size > MAX_CHUNK_SIZE {
            return Err(format!(
                "upload.default_chunk_size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE}"
            ));
        }
        if self.merge_workers == 0 {
            return Err("upload.merge_workers must be at least 1".to_string());
        }
        if self.merge_poll_interval_ms == 0 {
            return Err("upload.merge_poll_interval_ms must be at least 1".to_string());
        }
        if self.merge_buffer_size == 0 || self.large_merge_buffer_size == 0 {
            return Err("upload merge buffer sizes must be nonzero".to_string());
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn merge_poll_interval(&self) -> Duration {
        Duration::from_millis(self.merge_poll_interval_ms)
    }

    pub fn merge_wait_budget(&self) -> Duration {
        Duration::from_millis(self.merge_wait_budget_ms)
    }

    /// Upper bound on chunks per session. Kept as config surface so operators
    /// can lower it, but never above the hard cap.
    pub fn max_total_chunks(&self) -> u64 {
        MAX_TOTAL_CHUNKS
    }
}

/// Background expiry sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,

    /// Extra seconds past the session timeout before a session is reclaimed.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Maximum sessions reclaimed per sweep.
    #[serde(default = "default_janitor_batch_size")]
    pub batch_size: u32,

    /// Seconds a Merged or Cancelled row is kept for status queries before
    /// its record is deleted.
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention_secs: u64,
}

fn default_janitor_interval() -> u64 {
    3600
}

fn default_grace_period() -> u64 {
    300
}

fn default_janitor_batch_size() -> u32 {
    500
}

fn default_terminal_retention() -> u64 {
    3600
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval(),
            grace_period_secs: default_grace_period(),
            batch_size: default_janitor_batch_size(),
            terminal_retention_secs: default_terminal_retention(),
        }
    }
}

impl JanitorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("janitor.interval_secs must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            return Err("janitor.batch_size must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}

/// Where chunk staging files live.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagingConfig {
    #[serde(default)]
    pub root: PathBuf,
}

/// Session registry database location.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(default)]
    pub db_path: PathBuf,
}
