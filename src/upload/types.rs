//! Upload types for the resumable chunk protocol

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default maximum file size: 10GB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default maximum chunk size: 64MB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Default maximum number of chunks per session
pub const DEFAULT_MAX_CHUNK_COUNT: u64 = 100_000;

/// Default age after which a `processing` claim is considered abandoned
pub const DEFAULT_PROCESSING_STALE_SECS: i64 = 15 * 60;

// ============================================================================
// Chunk Geometry
// ============================================================================

/// Byte layout of a session's file split into fixed-size chunks.
///
/// Every chunk is `chunk_size` bytes except the last, which holds whatever
/// remains of `total_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub total_size: u64,
    pub chunk_size: u64,
}

impl ChunkLayout {
    /// Build a layout, rejecting zero sizes
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, UploadError> {
        if total_size == 0 {
            return Err(UploadError::InvalidRequest(
                "total_size must be greater than zero".to_string(),
            ));
        }
        if chunk_size == 0 {
            return Err(UploadError::InvalidRequest(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    /// ceil(total_size / chunk_size)
    pub fn chunk_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Byte offset of a chunk within the file
    pub fn offset(&self, chunk_index: u64) -> u64 {
        chunk_index * self.chunk_size
    }

    /// Exact length a chunk must have, or `None` if the index is out of range
    pub fn chunk_len(&self, chunk_index: u64) -> Option<u64> {
        let count = self.chunk_count();
        if chunk_index >= count {
            return None;
        }
        if chunk_index == count - 1 {
            Some(self.total_size - self.chunk_size * (count - 1))
        } else {
            Some(self.chunk_size)
        }
    }
}

// ============================================================================
// Handshake Types
// ============================================================================

/// Request to start an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Original file name (informational only)
    pub filename: String,

    /// Total file size in bytes
    pub total_size: u64,

    /// Size of every chunk except possibly the last
    pub chunk_size: u64,
}

/// Response to a handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Upload session ID, reused by the client for chunk and finalize calls
    pub id: String,

    /// Number of chunks the file is split into
    pub total_chunk_count: u64,

    /// Chunks already received (always empty for a fresh session)
    pub received_chunk_indices: Vec<u64>,
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// What happened to a submitted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    /// Bytes were written and the slot marked received
    Written,
    /// The slot was already received; the body was drained and discarded
    AlreadyReceived,
}

/// Response after submitting a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub chunk_index: u64,
    pub outcome: ChunkOutcome,
}

// ============================================================================
// Finalize Types
// ============================================================================

/// Result of a successful finalize call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// The session was sealed by an earlier call; nothing was recomputed
    AlreadyCompleted { final_digest: String },

    /// This call hashed and inspected the file and sealed the session
    Completed {
        digest: String,
        archive_top_level_entries: Vec<String>,
    },
}

impl FinalizeOutcome {
    pub fn digest(&self) -> &str {
        match self {
            Self::AlreadyCompleted { final_digest } => final_digest,
            Self::Completed { digest, .. } => digest,
        }
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting chunks
    Uploading,
    /// Finalize claimed the session and is hashing it
    Processing,
    /// Digest computed and stored
    Completed,
    /// Aborted by the client
    Failed,
}

/// Chunk slot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Received,
}

/// Upload session as stored in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunk_count: u64,
    pub status: SessionStatus,
    pub final_digest: Option<String>,
    pub archive_entries: Option<Vec<String>>,
    pub created_at: String,
    pub updated_at: String,
}

impl UploadSession {
    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
        }
    }
}

/// Session view returned by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: UploadSession,

    /// Received chunk indices in ascending order
    pub received_chunk_indices: Vec<u64>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Chunk {index} not found in session {session_id}")]
    ChunkNotFound { session_id: String, index: u64 },

    #[error("Chunk {index} must be {expected} bytes, got {actual}")]
    ChunkSizeMismatch { index: u64, expected: u64, actual: u64 },

    #[error("Upload incomplete, missing chunks: {missing:?}")]
    IncompleteUpload { missing: Vec<u64> },

    #[error("Finalize already in progress for session {0}")]
    FinalizeInProgress(String),

    #[error("Session is {status:?} and no longer accepts this operation")]
    SessionClosed { status: SessionStatus },

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::ChunkNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ChunkSizeMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::FinalizeInProgress(_) => StatusCode::CONFLICT,
            Self::SessionClosed { .. } => StatusCode::CONFLICT,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::ChunkNotFound { .. } => "CHUNK_NOT_FOUND",
            Self::ChunkSizeMismatch { .. } => "CHUNK_SIZE_MISMATCH",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::FinalizeInProgress(_) => "FINALIZE_IN_PROGRESS",
            Self::SessionClosed { .. } => "SESSION_CLOSED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(ChunkLayout::new(15, 5).unwrap().chunk_count(), 3);
        assert_eq!(ChunkLayout::new(11, 5).unwrap().chunk_count(), 3);
        assert_eq!(ChunkLayout::new(1, 5).unwrap().chunk_count(), 1);
        assert_eq!(ChunkLayout::new(5, 5).unwrap().chunk_count(), 1);
    }

    #[test]
    fn test_last_chunk_holds_remainder() {
        let layout = ChunkLayout::new(11, 5).unwrap();
        assert_eq!(layout.chunk_len(0), Some(5));
        assert_eq!(layout.chunk_len(1), Some(5));
        assert_eq!(layout.chunk_len(2), Some(1));
        assert_eq!(layout.chunk_len(3), None);
        assert_eq!(layout.offset(2), 10);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(matches!(
            ChunkLayout::new(0, 5),
            Err(UploadError::InvalidRequest(_))
        ));
        assert!(matches!(
            ChunkLayout::new(5, 0),
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_finalize_outcome_serialization() {
        let outcome = FinalizeOutcome::AlreadyCompleted {
            final_digest: "abc".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "already_completed");
        assert_eq!(json["final_digest"], "abc");
    }
}
