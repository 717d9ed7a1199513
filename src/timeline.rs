//! Branching checkpoint timeline for one session
//!
//! The timeline is a tree: every checkpoint except the session root has
//! exactly one parent, and forks create siblings rather than replacing
//! branches. It is represented as id-indexed records plus a secondary
//! parent->children index - no embedded bidirectional links - so lookup cost
//! does not depend on tree depth and cleanup can reason about reachability
//! purely via id lookups.
//!
//! Only checkpoint ids and the current pointer mutate here; checkpoint
//! records themselves are immutable once added. On disk, edges are not
//! stored at all: [`Timeline::from_records`] rebuilds the children index
//! from each record's `parent_checkpoint_id`.

use crate::error::{Result, WaypointError};
use crate::types::{BlobId, Checkpoint, CheckpointSettings, SessionTimeline, TimelineNode};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// In-memory timeline tree for a single session
#[derive(Debug, Clone)]
pub struct Timeline {
    session_id: String,
    /// All checkpoints indexed by id
    checkpoints: HashMap<String, Checkpoint>,
    /// Parent id -> child ids, in creation order
    children: HashMap<String, Vec<String>>,
    /// Root checkpoint id (absent only for an empty timeline)
    root_id: Option<String>,
    /// Currently active checkpoint id
    current_id: Option<String>,
}

impl Timeline {
    /// Create an empty timeline
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            checkpoints: HashMap::new(),
            children: HashMap::new(),
            root_id: None,
            current_id: None,
        }
    }

    /// Rebuild a timeline from persisted checkpoint records
    ///
    /// Records carry no edges; children are derived by indexing on
    /// `parent_checkpoint_id` and inserted parent-first, ordered by creation
    /// time within each sibling group. Records whose parent chain never
    /// reaches the root are skipped with a warning. The current pointer is
    /// validated against the rebuilt tree and dropped if unreachable.
    pub fn from_records(
        session_id: impl Into<String>,
        records: Vec<Checkpoint>,
        current_id: Option<String>,
    ) -> Result<Self> {
        let total = records.len();
        let mut by_parent: HashMap<Option<String>, Vec<Checkpoint>> = HashMap::new();
        for checkpoint in records {
            by_parent
                .entry(checkpoint.parent_checkpoint_id.clone())
                .or_default()
                .push(checkpoint);
        }
        for group in by_parent.values_mut() {
            group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        }

        let mut timeline = Self::new(session_id);
        let mut queue: VecDeque<Checkpoint> =
            by_parent.remove(&None).unwrap_or_default().into();
        while let Some(checkpoint) = queue.pop_front() {
            let id = checkpoint.id.clone();
            timeline.add_checkpoint(checkpoint)?;
            if let Some(children) = by_parent.remove(&Some(id)) {
                queue.extend(children);
            }
        }

        let attached = timeline.checkpoints.len();
        if attached < total {
            debug!(
                "Skipped {} checkpoint records unreachable from the root",
                total - attached
            );
        }

        if let Some(id) = current_id {
            if timeline.checkpoints.contains_key(&id) {
                timeline.current_id = Some(id);
            } else {
                debug!("Dropping stale current pointer {}", id);
            }
        }

        Ok(timeline)
    }

    /// Session this timeline belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Number of checkpoints in the tree
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Whether the timeline has no checkpoints yet
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Root checkpoint id
    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    /// Currently active checkpoint id
    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    /// Add a checkpoint under its recorded parent
    ///
    /// Fails with [`WaypointError::CheckpointNotFound`] if the parent id is
    /// absent, and rejects structures that would not remain a tree. The
    /// first checkpoint becomes both root and current.
    pub fn add_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let id = checkpoint.id.clone();

        if self.checkpoints.contains_key(&id) {
            return Err(WaypointError::internal(format!(
                "checkpoint {} already in timeline",
                id
            )));
        }

        match &checkpoint.parent_checkpoint_id {
            Some(parent_id) => {
                if !self.checkpoints.contains_key(parent_id) {
                    return Err(WaypointError::CheckpointNotFound(parent_id.clone()));
                }
                if id == *parent_id {
                    return Err(WaypointError::CircularDependency);
                }
                self.children
                    .entry(parent_id.clone())
                    .or_default()
                    .push(id.clone());
            }
            None => {
                if self.root_id.is_some() {
                    return Err(WaypointError::internal(format!(
                        "session {} already has a root checkpoint",
                        self.session_id
                    )));
                }
                self.root_id = Some(id.clone());
            }
        }

        self.checkpoints.insert(id.clone(), checkpoint);
        if self.current_id.is_none() {
            self.current_id = Some(id.clone());
        }

        trace!("Added checkpoint {} to timeline", &id[..8.min(id.len())]);
        Ok(())
    }

    /// Move the current pointer to an existing checkpoint
    pub fn set_current(&mut self, checkpoint_id: &str) -> Result<()> {
        if !self.checkpoints.contains_key(checkpoint_id) {
            return Err(WaypointError::CheckpointNotFound(checkpoint_id.to_string()));
        }
        self.current_id = Some(checkpoint_id.to_string());
        Ok(())
    }

    /// Look up a checkpoint by id
    pub fn get(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(checkpoint_id)
    }

    /// Whether the timeline contains the given id
    pub fn contains(&self, checkpoint_id: &str) -> bool {
        self.checkpoints.contains_key(checkpoint_id)
    }

    /// The currently active checkpoint
    pub fn current_checkpoint(&self) -> Option<&Checkpoint> {
        self.current_id.as_ref().and_then(|id| self.checkpoints.get(id))
    }

    /// Direct children of a checkpoint, in creation order
    pub fn children_of(&self, checkpoint_id: &str) -> &[String] {
        self.children
            .get(checkpoint_id)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Ids with no children
    pub fn leaves(&self) -> Vec<String> {
        self.checkpoints
            .keys()
            .filter(|id| self.children_of(id).is_empty())
            .cloned()
            .collect()
    }

    /// Ids on the path from the root to the current checkpoint, inclusive
    ///
    /// These are exactly the checkpoints cleanup must never remove.
    pub fn protected_path(&self) -> HashSet<String> {
        let mut protected = HashSet::new();
        let mut cursor = self.current_id.clone();
        while let Some(id) = cursor {
            cursor = self
                .checkpoints
                .get(&id)
                .and_then(|c| c.parent_checkpoint_id.clone());
            protected.insert(id);
        }
        protected
    }

    /// Whether `ancestor_id` lies on the parent chain of `descendant_id`
    pub fn is_ancestor_of(&self, ancestor_id: &str, descendant_id: &str) -> bool {
        let mut cursor = self
            .checkpoints
            .get(descendant_id)
            .and_then(|c| c.parent_checkpoint_id.as_deref());
        while let Some(id) = cursor {
            if id == ancestor_id {
                return true;
            }
            cursor = self
                .checkpoints
                .get(id)
                .and_then(|c| c.parent_checkpoint_id.as_deref());
        }
        false
    }

    /// Remove a leaf checkpoint from the tree
    ///
    /// Callers guarantee the node is prunable; a node with children is
    /// rejected to keep the structure a tree.
    pub fn remove_leaf(&mut self, checkpoint_id: &str) -> Result<Checkpoint> {
        if !self.children_of(checkpoint_id).is_empty() {
            return Err(WaypointError::internal(format!(
                "checkpoint {} has children and cannot be removed",
                checkpoint_id
            )));
        }

        let checkpoint = self
            .checkpoints
            .remove(checkpoint_id)
            .ok_or_else(|| WaypointError::CheckpointNotFound(checkpoint_id.to_string()))?;

        if let Some(parent_id) = &checkpoint.parent_checkpoint_id {
            if let Some(siblings) = self.children.get_mut(parent_id) {
                siblings.retain(|id| id != checkpoint_id);
                if siblings.is_empty() {
                    self.children.remove(parent_id);
                }
            }
        } else {
            self.root_id = None;
        }

        trace!(
            "Removed checkpoint {} from timeline",
            &checkpoint_id[..8.min(checkpoint_id.len())]
        );
        Ok(checkpoint)
    }

    /// All checkpoints in depth-first preorder from the root
    pub fn list(&self) -> Vec<Checkpoint> {
        let mut ordered = Vec::with_capacity(self.checkpoints.len());
        let mut stack: VecDeque<&str> = VecDeque::new();
        if let Some(root) = &self.root_id {
            stack.push_back(root);
        }

        while let Some(id) = stack.pop_back() {
            if let Some(checkpoint) = self.checkpoints.get(id) {
                ordered.push(checkpoint.clone());
            }
            let children = self.children_of(id);
            for child in children.iter().rev() {
                stack.push_back(child);
            }
        }

        ordered
    }

    /// Build the complete session view with children materialized recursively
    ///
    /// `introduced_blobs` maps checkpoint id to the blob ids that checkpoint
    /// introduced; the manager derives it from stored manifests.
    pub fn session_timeline(
        &self,
        settings: &CheckpointSettings,
        introduced_blobs: &HashMap<String, Vec<BlobId>>,
    ) -> SessionTimeline {
        SessionTimeline {
            session_id: self.session_id.clone(),
            root: self
                .root_id
                .as_ref()
                .map(|root| self.build_node(root, introduced_blobs)),
            current_checkpoint_id: self.current_id.clone(),
            auto_checkpoint_enabled: settings.auto_checkpoint_enabled,
            strategy: settings.strategy.clone(),
            total_checkpoints: self.checkpoints.len(),
        }
    }

    fn build_node(
        &self,
        checkpoint_id: &str,
        introduced_blobs: &HashMap<String, Vec<BlobId>>,
    ) -> TimelineNode {
        TimelineNode {
            checkpoint: self.checkpoints[checkpoint_id].clone(),
            children: self
                .children_of(checkpoint_id)
                .iter()
                .map(|child| self.build_node(child, introduced_blobs))
                .collect(),
            introduced_blobs: introduced_blobs
                .get(checkpoint_id)
                .cloned()
                .unwrap_or_default(),
        }
    }
}
