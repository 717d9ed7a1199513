//! Property-based tests for Waypoint
//!
//! Uses proptest to verify the structural invariants of the timeline and
//! the safety of cleanup across randomly generated operation sequences.

use proptest::prelude::*;
use std::collections::HashSet;
use std::fs;
use tempfile::TempDir;
use waypoint::*;

/// One step of a randomly generated session history
#[derive(Debug, Clone)]
enum HistoryOp {
    /// Create a checkpoint under the current one
    Create,
    /// Fork from the checkpoint at `index % len`
    Fork(usize),
    /// Restore to the checkpoint at `index % len`
    Restore(usize),
}

fn history_op_strategy() -> impl Strategy<Value = HistoryOp> {
    prop_oneof![
        3 => Just(HistoryOp::Create),
        1 => any::<usize>().prop_map(HistoryOp::Fork),
        1 => any::<usize>().prop_map(HistoryOp::Restore),
    ]
}

/// Apply an op sequence to an in-memory timeline, mirroring what the
/// manager does to the tree: create appends under current, fork moves
/// current then appends, restore only moves current.
fn build_timeline(ops: &[HistoryOp]) -> Timeline {
    let mut timeline = Timeline::new("prop-session");
    let mut ids: Vec<String> = Vec::new();

    let root = Checkpoint::new("prop-session", "p1", 0, None, None, Default::default());
    ids.push(root.id.clone());
    timeline.add_checkpoint(root).unwrap();

    for (step, op) in ops.iter().enumerate() {
        match op {
            HistoryOp::Create | HistoryOp::Fork(_) => {
                let parent = match op {
                    HistoryOp::Fork(index) => ids[index % ids.len()].clone(),
                    _ => timeline.current_id().unwrap().to_string(),
                };
                let checkpoint = Checkpoint::new(
                    "prop-session",
                    "p1",
                    step as u64,
                    None,
                    Some(parent),
                    Default::default(),
                );
                let id = checkpoint.id.clone();
                timeline.add_checkpoint(checkpoint).unwrap();
                timeline.set_current(&id).unwrap();
                ids.push(id);
            }
            HistoryOp::Restore(index) => {
                let target = ids[index % ids.len()].clone();
                timeline.set_current(&target).unwrap();
            }
        }
    }

    timeline
}

proptest! {
    /// Any create/fork/restore sequence yields a tree: acyclic, one parent
    /// per non-root node, current always reachable from the root
    #[test]
    fn prop_history_is_always_a_tree(ops in prop::collection::vec(history_op_strategy(), 0..40)) {
        let timeline = build_timeline(&ops);
        let checkpoints = timeline.list();

        // Preorder traversal visits every node exactly once
        prop_assert_eq!(checkpoints.len(), timeline.len());
        let unique: HashSet<&str> = checkpoints.iter().map(|c| c.id.as_str()).collect();
        prop_assert_eq!(unique.len(), checkpoints.len());

        // Exactly one root, and every parent chain terminates there
        let roots = checkpoints.iter().filter(|c| c.is_root()).count();
        prop_assert_eq!(roots, 1);
        for checkpoint in &checkpoints {
            let mut cursor = Some(checkpoint.id.clone());
            let mut steps = 0;
            while let Some(id) = cursor {
                prop_assert!(steps <= checkpoints.len(), "cycle detected at {}", id);
                cursor = timeline.get(&id).unwrap().parent_checkpoint_id.clone();
                steps += 1;
            }
        }

        // The current pointer denotes a node reachable from the root
        let current = timeline.current_id().unwrap();
        prop_assert!(timeline.get(current).is_some());
        let root_id = timeline.root_id().unwrap();
        prop_assert!(
            current == root_id || timeline.is_ancestor_of(root_id, current)
        );
    }

    /// Cleanup never removes the current checkpoint or any of its
    /// ancestors, however aggressive the policy
    #[test]
    fn prop_protected_path_survives_pruning(ops in prop::collection::vec(history_op_strategy(), 0..30)) {
        let mut timeline = build_timeline(&ops);
        let protected = timeline.protected_path();

        // Mirror the manager's bottom-up loop with an expire-everything
        // policy: every unprotected leaf goes
        loop {
            let candidates: Vec<String> = timeline
                .leaves()
                .into_iter()
                .filter(|id| !protected.contains(id))
                .collect();
            if candidates.is_empty() {
                break;
            }
            for id in candidates {
                timeline.remove_leaf(&id).unwrap();
            }
        }

        // Exactly the protected path remains
        let remaining: HashSet<String> =
            timeline.list().into_iter().map(|c| c.id).collect();
        prop_assert_eq!(remaining, protected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// End-to-end: random file mutations with interleaved checkpoints all
    /// restore to their exact captured contents
    #[test]
    fn prop_checkpoints_restore_exact_contents(
        rounds in prop::collection::vec(
            prop::collection::btree_map("[a-z]{1,6}\\.txt", "[a-zA-Z0-9 ]{0,64}", 1..5),
            1..5,
        )
    ) {
        let temp = TempDir::new().unwrap();
        let worktree = temp.path().join("project");
        fs::create_dir_all(&worktree).unwrap();
        let service = CheckpointService::new(temp.path().join("store")).unwrap();

        // Each round overwrites the whole tree with the generated files
        let mut captured = Vec::new();
        for files in &rounds {
            for entry in fs::read_dir(&worktree).unwrap() {
                fs::remove_file(entry.unwrap().path()).unwrap();
            }
            for (name, content) in files {
                fs::write(worktree.join(name), content).unwrap();
            }
            let result = service
                .create_checkpoint("prop", "p1", &worktree, None)
                .unwrap();
            captured.push((result.checkpoint.id, files.clone()));
        }

        // Restore each checkpoint (newest first) and compare trees
        for (id, files) in captured.iter().rev() {
            service
                .restore_checkpoint("prop", "p1", &worktree, id)
                .unwrap();

            let mut on_disk = std::collections::BTreeMap::new();
            for entry in fs::read_dir(&worktree).unwrap() {
                let entry = entry.unwrap();
                on_disk.insert(
                    entry.file_name().to_string_lossy().to_string(),
                    fs::read_to_string(entry.path()).unwrap(),
                );
            }
            prop_assert_eq!(&on_disk, files);
        }
    }
}
