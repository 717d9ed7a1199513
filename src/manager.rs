//! Checkpoint orchestration
//!
//! [`CheckpointManager`] is the only component allowed to mutate a session's
//! timeline. It coordinates the scanner, the snapshot store, the diff engine,
//! and the auto-checkpoint policy for one session. [`CheckpointService`] owns
//! one manager per session behind a per-session lock and is the surface a
//! transport layer talks to.
//!
//! ## Concurrency
//!
//! Each session is a single-writer resource: create, restore, fork, and
//! cleanup all read the current pointer and mutate the tree based on it, so
//! they serialize on the session's mutex. Lock waits are bounded; a timeout
//! surfaces as the retryable [`WaypointError::Conflict`]. Diff computation is
//! read-only against persisted records and runs without the session lock.
//! Sessions are fully independent of each other.

use crate::diff;
use crate::error::{Result, WaypointError};
use crate::policy::{self, PolicyCounters, SessionEvent};
use crate::store::SnapshotStore;
use crate::timeline::Timeline;
use crate::types::{
    Checkpoint, CheckpointDiff, CheckpointMetadata, CheckpointResult, CheckpointSettings,
    DiffOptions, MessageRole, RetentionPolicy, SessionState, SessionTimeline,
};
use crate::worktree::WorktreeScanner;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How long an operation waits for the session lock before reporting a
/// conflict
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Message metadata accumulated between checkpoints
///
/// Consumed (not cleared) at the next checkpoint: token totals are
/// cumulative for the session, and restore rewinds them to the restored
/// checkpoint's values.
#[derive(Debug, Clone, Default)]
struct PendingMessages {
    total_tokens: i64,
    message_index: u64,
    user_prompt: String,
    model_used: String,
}

/// Orchestrates checkpoint operations for a single session
pub struct CheckpointManager {
    session_id: String,
    project_id: String,
    scanner: WorktreeScanner,
    store: Arc<SnapshotStore>,
    timeline: Timeline,
    settings: CheckpointSettings,
    pending: PendingMessages,
    counters: PolicyCounters,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("session_id", &self.session_id)
            .field("project_id", &self.project_id)
            .field("checkpoints", &self.timeline.len())
            .field("current", &self.timeline.current_id())
            .finish()
    }
}

impl CheckpointManager {
    /// Create a manager for a session, loading any persisted state
    pub fn new(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        project_root: PathBuf,
        store: Arc<SnapshotStore>,
    ) -> Result<Self> {
        let session_id = session_id.into();
        let project_id = project_id.into();

        let (settings, current_id) = match store.load_session_state(&session_id) {
            Ok(state) => {
                if state.project_id != project_id {
                    warn!(
                        "Session {} was bound to project {}, now opened with {}",
                        session_id, state.project_id, project_id
                    );
                }
                (state.settings, state.current_checkpoint_id)
            }
            Err(WaypointError::SessionNotFound(_)) => (CheckpointSettings::default(), None),
            Err(e) => return Err(e),
        };

        let records = store.load_session_checkpoints(&session_id)?;
        let timeline = Timeline::from_records(&session_id, records, current_id)?;

        let pending = match timeline.current_checkpoint() {
            Some(current) => PendingMessages {
                total_tokens: current.metadata.total_tokens,
                message_index: current.message_index,
                user_prompt: current.metadata.user_prompt.clone(),
                model_used: current.metadata.model_used.clone(),
            },
            None => PendingMessages::default(),
        };
        let counters = PolicyCounters::reset(pending.message_index);

        debug!(
            "Opened session {} with {} checkpoints",
            session_id,
            timeline.len()
        );

        Ok(Self {
            session_id,
            project_id,
            scanner: WorktreeScanner::new(project_root),
            store,
            timeline,
            settings,
            pending,
            counters,
        })
    }

    /// Session this manager owns
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Accumulate token/message metadata for the next checkpoint
    pub fn track_message(&mut self, token_delta: i64, _role: MessageRole) {
        self.pending.total_tokens += token_delta;
        self.pending.message_index += 1;
    }

    /// Record the most recent user prompt text
    pub fn record_user_prompt(&mut self, prompt: impl Into<String>) {
        self.pending.user_prompt = prompt.into();
    }

    /// Record the model identifier in use
    pub fn record_model(&mut self, model: impl Into<String>) {
        self.pending.model_used = model.into();
    }

    /// Snapshot the working tree and append a checkpoint under the current
    /// one
    ///
    /// A storage failure during the snapshot or while persisting the record
    /// leaves the timeline and the current pointer untouched.
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub fn create_checkpoint(&mut self, description: Option<String>) -> Result<CheckpointResult> {
        let scan = self.scanner.scan()?;
        let manifest = self.store.snapshot(self.scanner.root(), &scan.files)?;

        let parent = self.timeline.current_checkpoint().cloned();
        let parent_manifest = match &parent {
            Some(parent) => Some(self.store.load_manifest(&self.session_id, &parent.id)?),
            None => None,
        };

        let file_changes = match &parent_manifest {
            Some(parent_manifest) => {
                let changes = diff::diff_manifests(parent_manifest, &manifest);
                changes.modified.len() + changes.added.len() + changes.deleted.len()
            }
            None => manifest.file_count(),
        };

        let message_index = self
            .pending
            .message_index
            .max(parent.as_ref().map(|p| p.message_index).unwrap_or(0));

        let checkpoint = Checkpoint::new(
            &self.session_id,
            &self.project_id,
            message_index,
            description,
            parent.as_ref().map(|p| p.id.clone()),
            CheckpointMetadata {
                total_tokens: self.pending.total_tokens,
                model_used: self.pending.model_used.clone(),
                user_prompt: self.pending.user_prompt.clone(),
                file_changes,
                snapshot_size: manifest.total_size,
            },
        );

        self.store.store_checkpoint(&checkpoint)?;
        if let Err(e) = self
            .store
            .store_manifest(&self.session_id, &checkpoint.id, &manifest)
        {
            // Keep the on-disk record set consistent with the in-memory tree
            let _ = self.store.delete_checkpoint(&self.session_id, &checkpoint.id);
            return Err(e);
        }

        self.timeline.add_checkpoint(checkpoint.clone())?;
        self.timeline.set_current(&checkpoint.id)?;
        self.persist_state()?;

        self.pending.message_index = message_index;
        self.counters = PolicyCounters::reset(message_index);

        info!(
            "Created checkpoint {} ({} files, {} changed)",
            checkpoint.short_id(),
            scan.files.len(),
            file_changes
        );

        Ok(CheckpointResult {
            checkpoint,
            files_processed: scan.files.len(),
            warnings: scan.warnings,
        })
    }

    /// Materialize a checkpoint's snapshot into the working tree and move
    /// the current pointer to it
    ///
    /// Descendant checkpoints are kept, so a later restore can move forward
    /// again ("redo").
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub fn restore_checkpoint(&mut self, checkpoint_id: &str) -> Result<CheckpointResult> {
        let checkpoint = self
            .timeline
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| WaypointError::CheckpointNotFound(checkpoint_id.to_string()))?;

        let manifest = self.store.load_manifest(&self.session_id, checkpoint_id)?;
        let tracked = self.scanner.scan()?.tracked_paths();
        let report = self
            .store
            .materialize(&manifest, self.scanner.root(), &tracked)?;

        self.timeline.set_current(checkpoint_id)?;
        self.persist_state()?;

        // Rewind accumulated metadata to the restored point
        self.pending.total_tokens = checkpoint.metadata.total_tokens;
        self.pending.message_index = checkpoint.message_index;
        self.pending.user_prompt = checkpoint.metadata.user_prompt.clone();
        self.pending.model_used = checkpoint.metadata.model_used.clone();
        self.counters = PolicyCounters::reset(checkpoint.message_index);

        info!(
            "Restored checkpoint {} ({} files written, {} deleted)",
            checkpoint.short_id(),
            report.files_written,
            report.files_deleted
        );

        Ok(CheckpointResult {
            checkpoint,
            files_processed: report.files_written,
            warnings: report.warnings,
        })
    }

    /// Branch from an existing checkpoint without discarding other branches
    ///
    /// Restores the target, then creates a new child under it; the new node
    /// becomes current and any existing children become its siblings. The
    /// target must belong to the same project root as the session.
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub fn fork_from_checkpoint(
        &mut self,
        checkpoint_id: &str,
        description: Option<String>,
    ) -> Result<CheckpointResult> {
        let target = self
            .timeline
            .get(checkpoint_id)
            .ok_or_else(|| WaypointError::CheckpointNotFound(checkpoint_id.to_string()))?;

        if target.project_id != self.project_id {
            return Err(WaypointError::InvalidFork {
                checkpoint_id: checkpoint_id.to_string(),
                expected_project: self.project_id.clone(),
                actual_project: target.project_id.clone(),
            });
        }

        self.restore_checkpoint(checkpoint_id)?;

        let description = description.or_else(|| {
            Some(format!(
                "Fork from {}",
                &checkpoint_id[..8.min(checkpoint_id.len())]
            ))
        });
        self.create_checkpoint(description)
    }

    /// All checkpoints in depth-first preorder from the root
    pub fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.timeline.list()
    }

    /// Full timeline view with children materialized recursively
    pub fn session_timeline(&self) -> Result<SessionTimeline> {
        // Derive per-checkpoint introduced blobs from stored manifests,
        // loading each manifest once
        let mut manifests = HashMap::new();
        for checkpoint in self.timeline.list() {
            let manifest = self.store.load_manifest(&self.session_id, &checkpoint.id)?;
            manifests.insert(checkpoint.id.clone(), (checkpoint, manifest));
        }

        let mut introduced = HashMap::new();
        for (id, (checkpoint, manifest)) in &manifests {
            let parent_manifest = checkpoint
                .parent_checkpoint_id
                .as_ref()
                .and_then(|pid| manifests.get(pid))
                .map(|(_, m)| m);
            introduced.insert(id.clone(), manifest.introduced_blobs(parent_manifest));
        }

        Ok(self.timeline.session_timeline(&self.settings, &introduced))
    }

    /// Current checkpoint settings
    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    /// Update settings; strategy changes apply to subsequent policy
    /// evaluations only
    pub fn update_settings(&mut self, settings: CheckpointSettings) -> Result<()> {
        self.settings = settings;
        self.persist_state()
    }

    /// Feed a session event through the auto-checkpoint policy
    ///
    /// Creates a checkpoint when the configured strategy fires; returns
    /// `None` when it does not, or when auto-checkpointing is disabled.
    pub fn observe_event(&mut self, event: &SessionEvent) -> Result<Option<CheckpointResult>> {
        if !self.settings.auto_checkpoint_enabled {
            return Ok(None);
        }
        if !policy::should_checkpoint(&self.settings.strategy, event, &self.counters) {
            return Ok(None);
        }

        debug!("Auto-checkpoint fired for session {}", self.session_id);
        self.create_checkpoint(None).map(Some)
    }

    /// Prune leaf checkpoints outside the retention window, bottom-up
    ///
    /// Never removes the current checkpoint or any of its ancestors, for
    /// any policy and any tree shape. Removing a leaf can expose its parent
    /// as a new candidate, so pruning iterates until a pass removes nothing.
    #[instrument(skip(self, retention), fields(session = %self.session_id))]
    pub fn cleanup_old_checkpoints(&mut self, retention: &RetentionPolicy) -> Result<usize> {
        let protected = self.timeline.protected_path();
        let mut pruned = 0usize;

        loop {
            let candidates: Vec<String> = self
                .timeline
                .leaves()
                .into_iter()
                .filter(|id| !protected.contains(id))
                .filter(|id| self.outside_retention(id, retention))
                .collect();

            if candidates.is_empty() {
                break;
            }

            for id in candidates {
                self.store.delete_checkpoint(&self.session_id, &id)?;
                self.timeline.remove_leaf(&id)?;
                pruned += 1;
            }
        }

        if pruned > 0 {
            info!(
                "Pruned {} checkpoints from session {}",
                pruned, self.session_id
            );
        }
        Ok(pruned)
    }

    fn outside_retention(&self, checkpoint_id: &str, retention: &RetentionPolicy) -> bool {
        let checkpoint = match self.timeline.get(checkpoint_id) {
            Some(c) => c,
            None => return false,
        };

        if let Some(max_age) = retention.max_age {
            let age = Utc::now().signed_duration_since(checkpoint.timestamp);
            if age.to_std().map(|a| a > max_age).unwrap_or(false) {
                return true;
            }
        }

        if let Some(keep_count) = retention.keep_count {
            // Rank by recency across the whole session; anything beyond the
            // newest keep_count is outside the window
            let mut timestamps: Vec<_> = self
                .timeline
                .list()
                .into_iter()
                .map(|c| (c.timestamp, c.id))
                .collect();
            timestamps.sort_by(|a, b| b.cmp(a));
            let rank = timestamps
                .iter()
                .position(|(_, id)| id == checkpoint_id)
                .unwrap_or(0);
            if rank >= keep_count {
                return true;
            }
        }

        false
    }

    fn persist_state(&self) -> Result<()> {
        self.store.save_session_state(&SessionState {
            session_id: self.session_id.clone(),
            project_id: self.project_id.clone(),
            current_checkpoint_id: self.timeline.current_id().map(|s| s.to_string()),
            settings: self.settings.clone(),
        })
    }
}

/// Session-keyed front for checkpoint operations
///
/// Holds one [`CheckpointManager`] per session behind a bounded-wait mutex.
/// This is the boundary a transport or UI layer calls into; every operation
/// maps one-to-one onto a manager method.
pub struct CheckpointService {
    store: Arc<SnapshotStore>,
    managers: DashMap<String, Arc<Mutex<CheckpointManager>>>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for CheckpointService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointService")
            .field("sessions", &self.managers.len())
            .finish()
    }
}

impl CheckpointService {
    /// Create a service over a store rooted at `store_root`
    pub fn new(store_root: PathBuf) -> Result<Self> {
        let store = Arc::new(SnapshotStore::init_or_open(store_root)?);
        Ok(Self::with_store(store))
    }

    /// Create a service over an existing store
    pub fn with_store(store: Arc<SnapshotStore>) -> Self {
        Self {
            store,
            managers: DashMap::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// The underlying snapshot store
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Override the bounded wait for session locks
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Get or create the manager for a session
    ///
    /// The entry is created under the map's shard lock so two racing
    /// callers can never end up with two managers for one session.
    pub fn session(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
    ) -> Result<Arc<Mutex<CheckpointManager>>> {
        match self.managers.entry(session_id.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let manager = CheckpointManager::new(
                    session_id,
                    project_id,
                    project_root.to_path_buf(),
                    Arc::clone(&self.store),
                )?;
                let manager = Arc::new(Mutex::new(manager));
                entry.insert(Arc::clone(&manager));
                Ok(manager)
            }
        }
    }

    /// Drop a session's in-memory manager, releasing its resources
    ///
    /// Persisted state is untouched; the next operation on the session
    /// reloads it.
    pub fn clear_session(&self, session_id: &str) {
        if self.managers.remove(session_id).is_some() {
            debug!("Cleared manager for session {}", session_id);
        }
    }

    /// Create a checkpoint of the session's working tree
    pub fn create_checkpoint(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
        description: Option<String>,
    ) -> Result<CheckpointResult> {
        self.with_session(session_id, project_id, project_root, |manager| {
            manager.create_checkpoint(description)
        })
    }

    /// Restore the session's working tree to a checkpoint
    pub fn restore_checkpoint(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
        checkpoint_id: &str,
    ) -> Result<CheckpointResult> {
        self.with_session(session_id, project_id, project_root, |manager| {
            manager.restore_checkpoint(checkpoint_id)
        })
    }

    /// Fork a new branch from an existing checkpoint
    pub fn fork_from_checkpoint(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
        checkpoint_id: &str,
        description: Option<String>,
    ) -> Result<CheckpointResult> {
        self.with_session(session_id, project_id, project_root, |manager| {
            manager.fork_from_checkpoint(checkpoint_id, description)
        })
    }

    /// List the session's checkpoints in depth-first preorder
    pub fn list_checkpoints(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
    ) -> Result<Vec<Checkpoint>> {
        self.with_session(session_id, project_id, project_root, |manager| {
            Ok(manager.list_checkpoints())
        })
    }

    /// Full timeline view for the session
    pub fn get_session_timeline(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
    ) -> Result<SessionTimeline> {
        self.with_session(session_id, project_id, project_root, |manager| {
            manager.session_timeline()
        })
    }

    /// Accumulate token/message metadata onto the session's next checkpoint
    pub fn track_checkpoint_message(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
        token_delta: i64,
        role: MessageRole,
    ) -> Result<()> {
        self.with_session(session_id, project_id, project_root, |manager| {
            manager.track_message(token_delta, role);
            Ok(())
        })
    }

    /// Read the session's checkpoint settings
    pub fn get_checkpoint_settings(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
    ) -> Result<CheckpointSettings> {
        self.with_session(session_id, project_id, project_root, |manager| {
            Ok(manager.settings().clone())
        })
    }

    /// Update the session's checkpoint settings
    pub fn update_checkpoint_settings(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
        settings: CheckpointSettings,
    ) -> Result<()> {
        self.with_session(session_id, project_id, project_root, |manager| {
            manager.update_settings(settings)
        })
    }

    /// Feed an external event through the session's auto-checkpoint policy
    pub fn observe_event(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
        event: &SessionEvent,
    ) -> Result<Option<CheckpointResult>> {
        self.with_session(session_id, project_id, project_root, |manager| {
            manager.observe_event(event)
        })
    }

    /// Prune old checkpoints outside the retention window
    pub fn cleanup_old_checkpoints(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
        retention: &RetentionPolicy,
    ) -> Result<usize> {
        self.with_session(session_id, project_id, project_root, |manager| {
            manager.cleanup_old_checkpoints(retention)
        })
    }

    /// Compute the diff between two checkpoints of a session
    ///
    /// Read-only: resolves both checkpoints from persisted records, so it
    /// runs without the session lock and can overlap mutating operations on
    /// other sessions.
    pub fn get_checkpoint_diff(
        &self,
        session_id: &str,
        from_checkpoint_id: &str,
        to_checkpoint_id: &str,
    ) -> Result<CheckpointDiff> {
        let from = self.store.load_checkpoint(session_id, from_checkpoint_id)?;
        let to = self.store.load_checkpoint(session_id, to_checkpoint_id)?;
        let from_manifest = self.store.load_manifest(session_id, from_checkpoint_id)?;
        let to_manifest = self.store.load_manifest(session_id, to_checkpoint_id)?;

        diff::diff_checkpoints(
            &self.store,
            &from,
            &from_manifest,
            &to,
            &to_manifest,
            &DiffOptions::default(),
        )
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        project_id: &str,
        project_root: &Path,
        f: impl FnOnce(&mut CheckpointManager) -> Result<T>,
    ) -> Result<T> {
        let manager = self.session(session_id, project_id, project_root)?;
        let mut guard = manager
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| WaypointError::Conflict {
                session_id: session_id.to_string(),
            })?;
        f(&mut guard)
    }
}
