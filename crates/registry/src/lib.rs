//! Session registry for the Sluice upload engine.
//!
//! The registry is the authoritative record of upload sessions: their
//! lifecycle status, which chunks have been received, and the outcome of
//! merges. All status transitions happen here, atomically.

pub mod error;
pub mod models;
pub mod sqlite;
pub mod traits;

pub use error::{RegistryError, Result};
pub use sqlite::SqliteRegistry;
pub use traits::{CancelOutcome, ChunkProgress, MergeClaim, SessionRegistry};
