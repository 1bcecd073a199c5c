//! Upload session model: identifiers, lifecycle status, and chunk arithmetic.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use time::OffsetDateTime;

use crate::{Error, Result, MAX_CHUNK_SIZE, MAX_TOTAL_CHUNKS, MIN_CHUNK_SIZE};

/// Opaque identifier for an upload session.
///
/// Derived from the session's identity fields plus its creation timestamp, so
/// two submissions of the same file produce distinct sessions.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
    /// Length of the hex-encoded identifier.
    pub const LEN: usize = 32;

    /// Derive a fresh identifier for a new session.
    pub fn derive(
        filename: &str,
        declared_size: u64,
        submitter: &str,
        created_at: OffsetDateTime,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(filename.as_bytes());
        hasher.update(declared_size.to_le_bytes());
        hasher.update(submitter.as_bytes());
        hasher.update(created_at.unix_timestamp_nanos().to_le_bytes());
        let digest = hasher.finalize();
        let hex: String = digest
            .iter()
            .take(Self::LEN / 2)
            .map(|b| format!("{b:02x}"))
            .collect();
        Self(hex)
    }

    /// Parse an identifier received from a client.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != Self::LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidUploadId(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an upload session.
///
/// ```text
/// Initialized -> InProgress -> AllReceived -> Merging -> Merged
///                                                     -> Failed -> Merging (retry)
/// any non-terminal, non-merging state -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Initialized,
    InProgress,
    AllReceived,
    Merging,
    Merged,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// Merged and Cancelled sessions never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Cancelled)
    }

    /// Whether chunk writes are accepted in this state.
    ///
    /// AllReceived still accepts chunks so that duplicate deliveries of the
    /// final chunk remain idempotent rather than erroring. Failed accepts
    /// chunks so a client can re-send whatever a merge found missing.
    pub fn accepts_chunks(&self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::InProgress | Self::AllReceived | Self::Failed
        )
    }

    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::InProgress => "in_progress",
            Self::AllReceived => "all_received",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "in_progress" => Ok(Self::InProgress),
            "all_received" => Ok(Self::AllReceived),
            "merging" => Ok(Self::Merging),
            "merged" => Ok(Self::Merged),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }

    /// Legal state transitions.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Initialized, InProgress) => true,
            (Initialized, AllReceived) => true,
            (InProgress, AllReceived) => true,
            (AllReceived, Merging) => true,
            (Failed, Merging) => true,
            (Failed, AllReceived) => true,
            (Merging, Merged) => true,
            (Merging, Failed) => true,
            (from, Cancelled) => !from.is_terminal() && *from != Merging,
            _ => false,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A chunked upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: UploadId,
    pub filename: String,
    pub declared_size: u64,
    pub target_dir: String,
    pub submitter: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub status: UploadStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Absolute path of the merged file, set once the session reaches Merged.
    pub final_path: Option<String>,
    /// Short machine-readable reason for a Failed session.
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
}

impl UploadSession {
    /// Create a new session, validating sizes and chunk arithmetic.
    pub fn new(
        filename: String,
        declared_size: u64,
        target_dir: String,
        submitter: String,
        chunk_size: u64,
    ) -> Result<Self> {
        if filename.is_empty() {
            return Err(Error::InvalidSession("filename must not be empty".into()));
        }
        if declared_size == 0 {
            return Err(Error::InvalidSession(
                "declared size must be greater than zero".into(),
            ));
        }
        if chunk_size < MIN_CHUNK_SIZE || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidChunkSize {
                size: chunk_size,
                min: MIN_CHUNK_SIZE,
                max: MAX_CHUNK_SIZE,
            });
        }
        let total_chunks = total_chunks(declared_size, chunk_size);
        if total_chunks > MAX_TOTAL_CHUNKS {
            return Err(Error::TooManyChunks {
                total: total_chunks,
                max: MAX_TOTAL_CHUNKS,
            });
        }

        let now = OffsetDateTime::now_utc();
        let upload_id = UploadId::derive(&filename, declared_size, &submitter, now);

        Ok(Self {
            upload_id,
            filename,
            declared_size,
            target_dir,
            submitter,
            chunk_size,
            total_chunks,
            status: UploadStatus::Initialized,
            created_at: now,
            updated_at: now,
            final_path: None,
            error_code: None,
            error_detail: None,
        })
    }

    /// Whether a chunk index is within the declared range.
    pub fn contains_index(&self, index: u32) -> bool {
        u64::from(index) < self.total_chunks
    }

    /// Expected byte length of the chunk at `index`.
    ///
    /// All chunks are `chunk_size` bytes except the last, which carries the
    /// remainder of `declared_size`.
    pub fn expected_chunk_len(&self, index: u32) -> Option<u64> {
        if !self.contains_index(index) {
            return None;
        }
        if u64::from(index) + 1 == self.total_chunks {
            let rem = self.declared_size % self.chunk_size;
            Some(if rem == 0 { self.chunk_size } else { rem })
        } else {
            Some(self.chunk_size)
        }
    }
}

/// Number of chunks needed to cover `declared_size` bytes.
pub fn total_chunks(declared_size: u64, chunk_size: u64) -> u64 {
    declared_size.div_ceil(chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(declared_size: u64, chunk_size: u64) -> UploadSession {
        UploadSession::new(
            "report.pdf".into(),
            declared_size,
            "/srv/files/docs".into(),
            "alice".into(),
            chunk_size,
        )
        .unwrap()
    }

    #[test]
    fn test_upload_id_derive_and_parse() {
        let now = OffsetDateTime::now_utc();
        let id = UploadId::derive("a.txt", 100, "bob", now);
        assert_eq!(id.as_str().len(), UploadId::LEN);

        let parsed = UploadId::parse(id.as_str()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_upload_id_rejects_garbage() {
        assert!(UploadId::parse("short").is_err());
        assert!(UploadId::parse(&"z".repeat(32)).is_err());
        assert!(UploadId::parse(&"../../etc/passwd".repeat(2)).is_err());
    }

    #[test]
    fn test_upload_ids_differ_across_time() {
        let t1 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let t2 = OffsetDateTime::from_unix_timestamp(1_700_000_001).unwrap();
        let a = UploadId::derive("a.txt", 100, "bob", t1);
        let b = UploadId::derive("a.txt", 100, "bob", t2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_total_chunks_arithmetic() {
        assert_eq!(total_chunks(100, 100), 1);
        assert_eq!(total_chunks(101, 100), 2);
        assert_eq!(total_chunks(200, 100), 2);
        assert_eq!(total_chunks(1, 100), 1);
    }

    #[test]
    fn test_expected_chunk_len() {
        let s = session(10 * MIN_CHUNK_SIZE + 17, MIN_CHUNK_SIZE);
        assert_eq!(s.total_chunks, 11);
        assert_eq!(s.expected_chunk_len(0), Some(MIN_CHUNK_SIZE));
        assert_eq!(s.expected_chunk_len(9), Some(MIN_CHUNK_SIZE));
        assert_eq!(s.expected_chunk_len(10), Some(17));
        assert_eq!(s.expected_chunk_len(11), None);
    }

    #[test]
    fn test_expected_chunk_len_exact_multiple() {
        let s = session(4 * MIN_CHUNK_SIZE, MIN_CHUNK_SIZE);
        assert_eq!(s.total_chunks, 4);
        assert_eq!(s.expected_chunk_len(3), Some(MIN_CHUNK_SIZE));
    }

    #[test]
    fn test_session_validation() {
        assert!(UploadSession::new("".into(), 10, "/d".into(), "a".into(), MIN_CHUNK_SIZE).is_err());
        assert!(UploadSession::new("f".into(), 0, "/d".into(), "a".into(), MIN_CHUNK_SIZE).is_err());
        assert!(UploadSession::new("f".into(), 10, "/d".into(), "a".into(), 1).is_err());
        assert!(
            UploadSession::new("f".into(), 10, "/d".into(), "a".into(), MAX_CHUNK_SIZE * 2)
                .is_err()
        );
    }

    #[test]
    fn test_too_many_chunks_rejected() {
        let declared = (MAX_TOTAL_CHUNKS + 1) * MIN_CHUNK_SIZE;
        let err = UploadSession::new("f".into(), declared, "/d".into(), "a".into(), MIN_CHUNK_SIZE);
        assert!(matches!(err, Err(Error::TooManyChunks { .. })));
    }

    #[test]
    fn test_status_transitions() {
        use UploadStatus::*;
        assert!(Initialized.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(AllReceived));
        assert!(AllReceived.can_transition_to(Merging));
        assert!(Merging.can_transition_to(Merged));
        assert!(Merging.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Merging));
        assert!(Failed.can_transition_to(AllReceived));

        assert!(Initialized.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Cancelled));
        assert!(!Merging.can_transition_to(Cancelled));
        assert!(!Merged.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(!Merged.can_transition_to(Merging));
    }

    #[test]
    fn test_status_roundtrip() {
        use UploadStatus::*;
        for s in [
            Initialized,
            InProgress,
            AllReceived,
            Merging,
            Merged,
            Failed,
            Cancelled,
        ] {
            assert_eq!(UploadStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(UploadStatus::parse("bogus").is_err());
    }
}
