//! Staged chunk storage for the Sluice upload engine.

pub mod error;
pub mod filesystem;
pub mod traits;

pub use error::{Result, StoreError};
pub use filesystem::FilesystemChunkStore;
pub use traits::ChunkStore;
