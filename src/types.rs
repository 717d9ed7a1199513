//! Core data types used throughout the Waypoint library
//!
//! This module contains the data model shared across components:
//!
//! - **Snapshots**: [`BlobRef`], [`SnapshotManifest`] - content-addressed
//!   working-tree state
//! - **History**: [`Checkpoint`], [`TimelineNode`], [`SessionTimeline`] -
//!   the branching timeline of a session
//! - **Operations**: [`CheckpointResult`], [`CheckpointDiff`], [`FileDiff`] -
//!   results returned to callers
//! - **Configuration**: [`CheckpointSettings`], [`CheckpointStrategy`],
//!   [`RetentionPolicy`], [`DiffOptions`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Identifier of a content-addressed blob: 64-char hex SHA-256 of the
/// uncompressed content.
pub type BlobId = String;

/// Reference to a stored blob from within a snapshot manifest
///
/// Carries everything needed to restore one file: the content address,
/// the original size, and the Unix permission bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Content hash of the file's bytes
    pub blob_id: BlobId,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Unix file permissions
    pub mode: u32,
}

/// Complete working-tree state at one instant
///
/// A mapping from relative file path to blob reference. Two manifests with
/// identical path->blob mappings represent the same tree state regardless of
/// when they were captured; compare with [`SnapshotManifest::same_contents`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Relative path -> blob reference, ordered for stable serialization
    pub files: BTreeMap<PathBuf, BlobRef>,
    /// Total uncompressed size of all files
    pub total_size: u64,
    /// Capture timestamp
    pub created_at: DateTime<Utc>,
}

impl SnapshotManifest {
    /// Create an empty manifest
    pub fn empty() -> Self {
        Self {
            files: BTreeMap::new(),
            total_size: 0,
            created_at: Utc::now(),
        }
    }

    /// Number of files in the snapshot
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Whether two manifests resolve to the same tree state
    ///
    /// Creation time is ignored; only the path->blob mapping matters.
    pub fn same_contents(&self, other: &SnapshotManifest) -> bool {
        self.files.len() == other.files.len()
            && self
                .files
                .iter()
                .all(|(path, blob)| other.files.get(path).map(|b| &b.blob_id) == Some(&blob.blob_id))
    }

    /// Blob ids this manifest references but `parent` does not
    pub fn introduced_blobs(&self, parent: Option<&SnapshotManifest>) -> Vec<BlobId> {
        let mut introduced: Vec<BlobId> = self
            .files
            .values()
            .filter(|blob| match parent {
                Some(p) => !p.files.values().any(|b| b.blob_id == blob.blob_id),
                None => true,
            })
            .map(|blob| blob.blob_id.clone())
            .collect();
        introduced.sort();
        introduced.dedup();
        introduced
    }
}

/// An immutable node in a session's history
///
/// Each checkpoint belongs to exactly one session and one project, references
/// its parent by id (absent only for the session root), and is never mutated
/// after creation. Only the session's current pointer and the parent's child
/// index change as the timeline grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Session this checkpoint belongs to
    pub session_id: String,
    /// Project root identifier
    pub project_id: String,
    /// Message counter at capture time, non-decreasing along any
    /// root-to-leaf path
    pub message_index: u64,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
    /// User-provided description
    pub description: Option<String>,
    /// Parent checkpoint id (None for the session root)
    pub parent_checkpoint_id: Option<String>,
    /// Accumulated session metadata
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create a new checkpoint with a fresh UUID and the current time
    pub fn new(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        message_index: u64,
        description: Option<String>,
        parent_checkpoint_id: Option<String>,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            project_id: project_id.into(),
            message_index,
            timestamp: Utc::now(),
            description,
            parent_checkpoint_id,
            metadata,
        }
    }

    /// Whether this is the session root
    pub fn is_root(&self) -> bool {
        self.parent_checkpoint_id.is_none()
    }

    /// Short id for display (first 8 characters)
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}

/// Metadata accumulated onto a checkpoint from the session's message stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Total tokens consumed up to this checkpoint
    pub total_tokens: i64,
    /// Model identifier extracted from the most recent assistant message
    pub model_used: String,
    /// Most recent user prompt text
    pub user_prompt: String,
    /// Files changed relative to the parent checkpoint
    pub file_changes: usize,
    /// Total uncompressed snapshot size in bytes
    pub snapshot_size: u64,
}

/// Role of a tracked session message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Message authored by the user
    User,
    /// Message authored by the assistant
    Assistant,
}

/// A checkpoint with its children materialized, for timeline rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineNode {
    /// The checkpoint at this node
    pub checkpoint: Checkpoint,
    /// Ordered child nodes (creation order)
    pub children: Vec<TimelineNode>,
    /// Blob ids this checkpoint introduced relative to its parent
    pub introduced_blobs: Vec<BlobId>,
}

/// Complete timeline view for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTimeline {
    /// Session identifier
    pub session_id: String,
    /// Root node with children materialized recursively
    pub root: Option<TimelineNode>,
    /// Currently active checkpoint, always reachable from the root
    pub current_checkpoint_id: Option<String>,
    /// Whether auto-checkpointing is enabled
    pub auto_checkpoint_enabled: bool,
    /// Active auto-checkpoint strategy
    pub strategy: CheckpointStrategy,
    /// Total number of checkpoints in the tree
    pub total_checkpoints: usize,
}

/// Per-session checkpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// Whether the auto-checkpoint policy is consulted at all
    pub auto_checkpoint_enabled: bool,
    /// Strategy evaluated by the auto-checkpoint policy
    pub strategy: CheckpointStrategy,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            auto_checkpoint_enabled: false,
            strategy: CheckpointStrategy::Manual,
        }
    }
}

/// When checkpoints should be created automatically
///
/// Dispatched by configuration, not subclassing: the policy matches on the
/// variant for every incoming session event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategy {
    /// Never checkpoint automatically
    Manual,
    /// Checkpoint after every completed user/assistant exchange
    PerPrompt,
    /// Checkpoint after every file-modifying tool invocation
    PerToolUse,
    /// Checkpoint once the given wall-clock interval has elapsed
    TimeInterval(Duration),
}

/// Result of a create/restore/fork operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointResult {
    /// The checkpoint that was created or restored
    pub checkpoint: Checkpoint,
    /// Number of files snapshotted or materialized
    pub files_processed: usize,
    /// Non-fatal problems encountered (e.g. skipped oversized files)
    pub warnings: Vec<String>,
}

/// Difference between two checkpoints
///
/// Directional: additions and deletions are reported relative to
/// `from` -> `to`. Comparing a checkpoint against itself yields an empty
/// diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDiff {
    /// Source checkpoint id
    pub from_checkpoint_id: String,
    /// Target checkpoint id
    pub to_checkpoint_id: String,
    /// Files present in both with differing content
    pub modified_files: Vec<FileDiff>,
    /// Paths present only in the target
    pub added_files: Vec<PathBuf>,
    /// Paths present only in the source
    pub deleted_files: Vec<PathBuf>,
    /// Difference in accumulated token counts between the two checkpoints
    pub token_delta: i64,
}

impl CheckpointDiff {
    /// Whether the two checkpoints resolve to identical trees
    pub fn is_empty(&self) -> bool {
        self.modified_files.is_empty()
            && self.added_files.is_empty()
            && self.deleted_files.is_empty()
    }
}

/// Line-level difference for a single modified file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    /// Relative path of the file
    pub path: PathBuf,
    /// Lines added
    pub additions: usize,
    /// Lines deleted
    pub deletions: usize,
    /// Rendered unified diff text; None for binary or oversized files
    pub diff_content: Option<String>,
}

/// Bounds on which leaf checkpoints cleanup may prune
///
/// A leaf falls outside the retention window when it is older than
/// `max_age` or ranked beyond the newest `keep_count` checkpoints of the
/// session. Unset fields impose no bound.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    /// Keep at most this many checkpoints
    pub keep_count: Option<usize>,
    /// Keep only checkpoints younger than this
    pub max_age: Option<Duration>,
}

/// Options controlling line-diff generation
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Unchanged lines shown around each change
    pub context_lines: usize,
    /// Files larger than this are reported without rendered content
    pub max_file_size: u64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            context_lines: 3,
            max_file_size: 1024 * 1024,
        }
    }
}

/// Persisted per-session state: the current pointer plus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Session identifier
    pub session_id: String,
    /// Project root identifier the session is bound to
    pub project_id: String,
    /// Currently active checkpoint
    pub current_checkpoint_id: Option<String>,
    /// Checkpoint configuration
    pub settings: CheckpointSettings,
}

/// Metadata stored at the store root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Version of the on-disk format
    pub format_version: u32,
    /// Waypoint version that created the store
    pub waypoint_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}
