//! Integration tests for Waypoint
//!
//! Exercises full create/restore/fork/diff/cleanup flows through the
//! service front, the way a transport layer would drive them.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use waypoint::*;

const SESSION: &str = "session-1";
const PROJECT: &str = "project-1";

/// Test harness owning a service, a working tree, and their temp dirs
pub struct WaypointTestHarness {
    pub service: CheckpointService,
    pub worktree: PathBuf,
    _temp: TempDir,
}

impl WaypointTestHarness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let worktree = temp.path().join("project");
        fs::create_dir_all(&worktree).unwrap();
        let service = CheckpointService::new(temp.path().join("store")).unwrap();
        Self {
            service,
            worktree,
            _temp: temp,
        }
    }

    pub fn write(&self, path: &str, content: &str) {
        let full = self.worktree.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }

    pub fn delete(&self, path: &str) {
        fs::remove_file(self.worktree.join(path)).unwrap();
    }

    pub fn read(&self, path: &str) -> String {
        fs::read_to_string(self.worktree.join(path)).unwrap()
    }

    pub fn checkpoint(&self, description: &str) -> CheckpointResult {
        self.service
            .create_checkpoint(
                SESSION,
                PROJECT,
                &self.worktree,
                Some(description.to_string()),
            )
            .unwrap()
    }

    pub fn restore(&self, checkpoint_id: &str) -> CheckpointResult {
        self.service
            .restore_checkpoint(SESSION, PROJECT, &self.worktree, checkpoint_id)
            .unwrap()
    }

    pub fn track(&self, tokens: i64, role: MessageRole) {
        self.service
            .track_checkpoint_message(SESSION, PROJECT, &self.worktree, tokens, role)
            .unwrap()
    }

    pub fn timeline(&self) -> SessionTimeline {
        self.service
            .get_session_timeline(SESSION, PROJECT, &self.worktree)
            .unwrap()
    }

    pub fn store_root(&self) -> PathBuf {
        self._temp.path().join("store")
    }
}

#[test]
fn test_documented_diff_scenario() {
    // C1 with {a.txt, c.txt} at 100 tokens; modify a.txt and add b.txt;
    // C2 at 140 tokens; diff(C1, C2) reports exactly that
    let h = WaypointTestHarness::new();
    h.write("a.txt", "alpha line one\nalpha line two\n");
    h.write("c.txt", "gamma\n");
    h.track(100, MessageRole::User);
    let c1 = h.checkpoint("c1");

    h.write("a.txt", "alpha line one\nalpha line two changed\n");
    h.write("b.txt", "beta\n");
    h.track(40, MessageRole::Assistant);
    let c2 = h.checkpoint("c2");

    let diff = h
        .service
        .get_checkpoint_diff(SESSION, &c1.checkpoint.id, &c2.checkpoint.id)
        .unwrap();

    assert_eq!(diff.token_delta, 40);
    assert_eq!(diff.modified_files.len(), 1);
    assert_eq!(diff.modified_files[0].path, Path::new("a.txt"));
    assert_eq!(diff.modified_files[0].additions, 1);
    assert_eq!(diff.modified_files[0].deletions, 1);
    let rendered = diff.modified_files[0].diff_content.as_ref().unwrap();
    assert!(rendered.contains("-alpha line two"));
    assert!(rendered.contains("+alpha line two changed"));
    assert_eq!(diff.added_files, vec![PathBuf::from("b.txt")]);
    assert!(diff.deleted_files.is_empty());

    // Reverse direction swaps added for deleted
    let reverse = h
        .service
        .get_checkpoint_diff(SESSION, &c2.checkpoint.id, &c1.checkpoint.id)
        .unwrap();
    assert_eq!(reverse.token_delta, -40);
    assert_eq!(reverse.deleted_files, vec![PathBuf::from("b.txt")]);
    assert!(reverse.added_files.is_empty());
}

#[test]
fn test_multi_branch_timeline_shape() {
    let h = WaypointTestHarness::new();
    h.write("main.rs", "fn main() {}\n");
    let c1 = h.checkpoint("base");

    h.write("main.rs", "fn main() { println!(\"one\"); }\n");
    let c2 = h.checkpoint("branch one");

    // Fork back at C1, creating a sibling
    let c3 = h
        .service
        .fork_from_checkpoint(SESSION, PROJECT, &h.worktree, &c1.checkpoint.id, None)
        .unwrap();

    // Continue on the fork
    h.write("main.rs", "fn main() { println!(\"two\"); }\n");
    let c4 = h.checkpoint("fork continues");

    let timeline = h.timeline();
    assert_eq!(timeline.total_checkpoints, 4);
    assert_eq!(
        timeline.current_checkpoint_id.as_deref(),
        Some(c4.checkpoint.id.as_str())
    );

    let root = timeline.root.unwrap();
    assert_eq!(root.checkpoint.id, c1.checkpoint.id);
    let child_ids: Vec<&str> = root
        .children
        .iter()
        .map(|n| n.checkpoint.id.as_str())
        .collect();
    assert_eq!(child_ids, vec![c2.checkpoint.id.as_str(), c3.checkpoint.id.as_str()]);

    // Cross-branch diff works without a common restore
    let diff = h
        .service
        .get_checkpoint_diff(SESSION, &c2.checkpoint.id, &c4.checkpoint.id)
        .unwrap();
    assert_eq!(diff.modified_files.len(), 1);

    // Both branch tips restore their exact contents
    h.restore(&c2.checkpoint.id);
    assert!(h.read("main.rs").contains("one"));
    h.restore(&c4.checkpoint.id);
    assert!(h.read("main.rs").contains("two"));
}

#[test]
fn test_restore_is_exact_and_descendants_survive() {
    let h = WaypointTestHarness::new();
    h.write("kept.txt", "kept");
    h.write("doomed.txt", "original");
    let c1 = h.checkpoint("c1");

    h.write("doomed.txt", "rewritten");
    h.write("added.txt", "added later");
    h.delete("kept.txt");
    let c2 = h.checkpoint("c2");

    let result = h.restore(&c1.checkpoint.id);
    assert_eq!(result.checkpoint.id, c1.checkpoint.id);
    assert_eq!(h.read("kept.txt"), "kept");
    assert_eq!(h.read("doomed.txt"), "original");
    assert!(!h.worktree.join("added.txt").exists());

    // C2 is still present and restorable
    let listed = h
        .service
        .list_checkpoints(SESSION, PROJECT, &h.worktree)
        .unwrap();
    assert!(listed.iter().any(|c| c.id == c2.checkpoint.id));
    h.restore(&c2.checkpoint.id);
    assert_eq!(h.read("doomed.txt"), "rewritten");
    assert_eq!(h.read("added.txt"), "added later");
    assert!(!h.worktree.join("kept.txt").exists());
}

#[test]
fn test_restore_then_create_produces_identical_snapshot() {
    let h = WaypointTestHarness::new();
    h.write("a.txt", "one");
    h.write("b.txt", "two");
    let c1 = h.checkpoint("c1");

    h.write("a.txt", "changed");
    h.checkpoint("c2");

    h.restore(&c1.checkpoint.id);
    let c3 = h.checkpoint("c3");

    assert_eq!(c3.checkpoint.metadata.file_changes, 0);
    let diff = h
        .service
        .get_checkpoint_diff(SESSION, &c1.checkpoint.id, &c3.checkpoint.id)
        .unwrap();
    assert!(diff.is_empty());
}

#[test]
fn test_message_index_monotonic_across_restores() {
    let h = WaypointTestHarness::new();
    h.write("a.txt", "1");
    h.track(10, MessageRole::User);
    let c1 = h.checkpoint("c1");

    h.track(10, MessageRole::Assistant);
    h.track(10, MessageRole::User);
    h.write("a.txt", "2");
    let c2 = h.checkpoint("c2");
    assert!(c2.checkpoint.message_index >= c1.checkpoint.message_index);

    // Fork from C1 after more messages were tracked: the new child's index
    // must still be >= its parent's
    h.track(10, MessageRole::Assistant);
    let c3 = h
        .service
        .fork_from_checkpoint(SESSION, PROJECT, &h.worktree, &c1.checkpoint.id, None)
        .unwrap();
    assert!(c3.checkpoint.message_index >= c1.checkpoint.message_index);

    // Every root-to-leaf path is non-decreasing
    let timeline = h.timeline();
    fn check(node: &TimelineNode) {
        for child in &node.children {
            assert!(child.checkpoint.message_index >= node.checkpoint.message_index);
            check(child);
        }
    }
    check(&timeline.root.unwrap());
}

#[test]
fn test_cleanup_prunes_stale_branch_bottom_up() {
    let h = WaypointTestHarness::new();
    h.write("a.txt", "base");
    let c1 = h.checkpoint("base");

    h.write("a.txt", "abandoned 1");
    let c2 = h.checkpoint("abandoned 1");
    h.write("a.txt", "abandoned 2");
    let c3 = h.checkpoint("abandoned 2");

    // Fork a fresh branch from the root; the C2->C3 chain becomes stale
    let c4 = h
        .service
        .fork_from_checkpoint(SESSION, PROJECT, &h.worktree, &c1.checkpoint.id, None)
        .unwrap();

    let pruned = h
        .service
        .cleanup_old_checkpoints(
            SESSION,
            PROJECT,
            &h.worktree,
            &RetentionPolicy {
                keep_count: None,
                max_age: Some(std::time::Duration::ZERO),
            },
        )
        .unwrap();

    // C3 first (leaf), then C2 once exposed; C1 and C4 are protected
    assert_eq!(pruned, 2);
    let remaining: Vec<String> = h
        .service
        .list_checkpoints(SESSION, PROJECT, &h.worktree)
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&c1.checkpoint.id));
    assert!(remaining.contains(&c4.checkpoint.id));
    assert!(!remaining.contains(&c2.checkpoint.id));
    assert!(!remaining.contains(&c3.checkpoint.id));

    // The pruned records are gone from disk too
    assert!(matches!(
        h.service.get_checkpoint_diff(SESSION, &c2.checkpoint.id, &c1.checkpoint.id),
        Err(WaypointError::CheckpointNotFound(_))
    ));
}

#[test]
fn test_corrupt_blob_fails_one_restore_not_the_session() {
    let h = WaypointTestHarness::new();
    h.write("a.txt", "version one");
    let c1 = h.checkpoint("c1");

    h.write("a.txt", "version two");
    let c2 = h.checkpoint("c2");

    // Corrupt the blob backing C1's snapshot
    let manifest_blob = {
        let diff = h
            .service
            .get_checkpoint_diff(SESSION, &c1.checkpoint.id, &c2.checkpoint.id)
            .unwrap();
        assert_eq!(diff.modified_files.len(), 1);
        // Locate C1's a.txt blob through the store
        let timeline = h.timeline();
        timeline.root.unwrap().introduced_blobs[0].clone()
    };
    let (prefix, suffix) = manifest_blob.split_at(2);
    let blob_path = h.store_root().join("blobs").join(prefix).join(suffix);
    fs::write(&blob_path, b"garbage").unwrap();

    // Restoring C1 fails with corruption and leaves the tree untouched
    let err = h
        .service
        .restore_checkpoint(SESSION, PROJECT, &h.worktree, &c1.checkpoint.id)
        .unwrap_err();
    assert!(err.is_corruption());
    assert_eq!(h.read("a.txt"), "version two");

    // The session is still usable: C2 restores fine
    let result = h.restore(&c2.checkpoint.id);
    assert_eq!(result.checkpoint.id, c2.checkpoint.id);
    assert_eq!(h.read("a.txt"), "version two");
}

#[test]
fn test_time_interval_auto_checkpoint() {
    let h = WaypointTestHarness::new();
    h.write("a.txt", "x");
    h.checkpoint("manual base");

    h.service
        .update_checkpoint_settings(
            SESSION,
            PROJECT,
            &h.worktree,
            CheckpointSettings {
                auto_checkpoint_enabled: true,
                strategy: CheckpointStrategy::TimeInterval(std::time::Duration::from_secs(600)),
            },
        )
        .unwrap();

    // A tick before the interval elapses does nothing
    let soon = chrono::Utc::now() + chrono::Duration::seconds(30);
    let fired = h
        .service
        .observe_event(SESSION, PROJECT, &h.worktree, &SessionEvent::Tick { now: soon })
        .unwrap();
    assert!(fired.is_none());

    // A tick past the interval creates a checkpoint
    let later = chrono::Utc::now() + chrono::Duration::seconds(700);
    let fired = h
        .service
        .observe_event(SESSION, PROJECT, &h.worktree, &SessionEvent::Tick { now: later })
        .unwrap();
    let result = fired.expect("interval elapsed, checkpoint expected");
    assert_eq!(h.timeline().total_checkpoints, 2);
    assert_eq!(
        h.timeline().current_checkpoint_id.as_deref(),
        Some(result.checkpoint.id.as_str())
    );
}

#[test]
fn test_state_survives_service_restart() {
    let temp = TempDir::new().unwrap();
    let worktree = temp.path().join("project");
    fs::create_dir_all(&worktree).unwrap();
    let store_root = temp.path().join("store");

    let (c1_id, c2_id) = {
        let service = CheckpointService::new(store_root.clone()).unwrap();
        fs::write(worktree.join("a.txt"), "one").unwrap();
        let c1 = service
            .create_checkpoint(SESSION, PROJECT, &worktree, None)
            .unwrap();
        fs::write(worktree.join("a.txt"), "two").unwrap();
        let c2 = service
            .create_checkpoint(SESSION, PROJECT, &worktree, None)
            .unwrap();
        (c1.checkpoint.id, c2.checkpoint.id)
    };

    // A brand new service over the same store sees the whole timeline
    let service = CheckpointService::new(store_root).unwrap();
    let timeline = service
        .get_session_timeline(SESSION, PROJECT, &worktree)
        .unwrap();
    assert_eq!(timeline.total_checkpoints, 2);
    assert_eq!(timeline.current_checkpoint_id.as_deref(), Some(c2_id.as_str()));

    service
        .restore_checkpoint(SESSION, PROJECT, &worktree, &c1_id)
        .unwrap();
    assert_eq!(fs::read_to_string(worktree.join("a.txt")).unwrap(), "one");
}
