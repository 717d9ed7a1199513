//! # Waypoint - session checkpoint timelines
//!
//! A checkpoint/timeline engine for assistant-driven editing sessions.
//! Waypoint captures versioned snapshots of a working file tree, organizes
//! them into a branching per-session history, and restores any past state
//! atomically without corrupting the working tree or the history graph.
//!
//! ## Overview
//!
//! - Create immutable checkpoints of a project directory, deduplicated
//!   through content-addressed blob storage
//! - Restore the working tree to any checkpoint, all-or-nothing
//! - Fork from any checkpoint into a sibling branch without discarding
//!   existing history
//! - Diff any two checkpoints: per-path classification plus line-level
//!   unified diffs and token deltas
//! - Decide when to checkpoint automatically via pluggable strategies
//!   (per-prompt, per-tool-use, time-interval, manual)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use waypoint::CheckpointService;
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = CheckpointService::new(PathBuf::from("./.waypoint"))?;
//! let project = Path::new("./my_project");
//!
//! // Checkpoint the current working tree
//! let result = service.create_checkpoint(
//!     "session-1",
//!     "project-1",
//!     project,
//!     Some("Before refactor".to_string()),
//! )?;
//! println!("Created checkpoint {}", result.checkpoint.id);
//!
//! // ...edit files...
//!
//! // Restore the earlier state; later checkpoints stay restorable
//! service.restore_checkpoint("session-1", "project-1", project, &result.checkpoint.id)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`store`]: content-addressed blob storage with deduplication,
//!   snapshot manifests, and transactional restore
//! - [`timeline`]: the branching history tree, indexed by checkpoint id
//! - [`diff`]: manifest classification and LCS line diffs
//! - [`policy`]: the pure auto-checkpoint decision function
//! - [`manager`]: per-session orchestration and the service front
//! - [`worktree`]: gitignore-aware working-tree enumeration
//!
//! Each session's timeline is a single-writer resource guarded by a
//! per-session lock; sessions are otherwise fully independent. All
//! operations return [`Result`] with ids attached to every error.

pub mod diff;
pub mod error;
pub mod manager;
pub mod policy;
pub mod store;
pub mod timeline;
pub mod types;
pub mod worktree;

pub use error::{Result, WaypointError};
pub use manager::{CheckpointManager, CheckpointService};
pub use policy::{PolicyCounters, SessionEvent};
pub use store::{MaterializeReport, SnapshotStore, StoreStats};
pub use timeline::Timeline;
pub use types::*;
pub use worktree::{ScanOutcome, ScannedFile, WorktreeScanner};
