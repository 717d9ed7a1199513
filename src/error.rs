//! Error types for the Waypoint library
//!
//! All fallible operations return [`Result`]. Errors carry the ids involved
//! (session, checkpoint, blob) so callers can report or retry without extra
//! bookkeeping.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Waypoint library
pub type Result<T> = std::result::Result<T, WaypointError>;

/// Main error type for all Waypoint operations
#[derive(Debug, Error)]
pub enum WaypointError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Checkpoint not found in the session's timeline
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Session has no persisted state
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Blob not found in content-addressed storage
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// Another exclusive operation is already running on the session
    #[error("Operation already in progress on session {session_id}")]
    Conflict {
        /// Session whose lock could not be acquired
        session_id: String,
    },

    /// Stored blob content no longer matches its recorded hash
    #[error("Corrupt snapshot blob {blob_id} - expected {expected}, actual {actual}")]
    CorruptSnapshot {
        /// Blob identifier that failed verification
        blob_id: String,
        /// Hash recorded when the blob was stored
        expected: String,
        /// Hash computed from the on-disk content
        actual: String,
    },

    /// Fork target belongs to a different project root than the session
    #[error("Invalid fork from checkpoint {checkpoint_id}: project {actual_project} does not match session project {expected_project}")]
    InvalidFork {
        /// Checkpoint the fork was requested from
        checkpoint_id: String,
        /// Project id the session is bound to
        expected_project: String,
        /// Project id recorded on the target checkpoint
        actual_project: String,
    },

    /// Adding a checkpoint would create a cycle in the timeline
    #[error("Circular dependency detected in timeline")]
    CircularDependency,

    /// Storage is not initialized
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Storage already exists
    #[error("Storage already exists at path: {0:?}")]
    StorageAlreadyExists(PathBuf),

    /// Restore operation failed and was rolled back
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for WaypointError {
    fn from(err: bincode::error::DecodeError) -> Self {
        WaypointError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for WaypointError {
    fn from(err: bincode::error::EncodeError) -> Self {
        WaypointError::Bincode(err.to_string())
    }
}

impl WaypointError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        WaypointError::Internal(msg.into())
    }

    /// Check if this error is safe to retry without intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self, WaypointError::Conflict { .. })
    }

    /// Check if this error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, WaypointError::CorruptSnapshot { .. })
    }
}
