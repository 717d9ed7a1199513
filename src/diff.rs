//! Diff computation between checkpoints
//!
//! Two layers: manifest classification (which paths were added, modified,
//! or deleted, decided purely by blob id) and line-level diffing of modified
//! text files, rendered in unified format.
//!
//! The line diff finds the longest common subsequence between the two line
//! vectors with the classic O(mn) dynamic program, then groups the resulting
//! edit script into hunks with a configurable number of context lines.
//! Binary content (NUL byte in the first 8 KiB) and files above the size cap
//! are reported without rendered text.
//!
//! Diffing never touches the live working tree: both sides are resolved from
//! stored manifests and blobs.

use crate::error::Result;
use crate::store::SnapshotStore;
use crate::types::{BlobRef, Checkpoint, CheckpointDiff, DiffOptions, FileDiff, SnapshotManifest};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Path-level changes between two manifests
#[derive(Debug, Default)]
pub struct ManifestChanges {
    /// Present in both with differing blob ids: (path, from, to)
    pub modified: Vec<(PathBuf, BlobRef, BlobRef)>,
    /// Present only in the target
    pub added: Vec<PathBuf>,
    /// Present only in the source
    pub deleted: Vec<PathBuf>,
}

/// Classify every path in the union of two manifests
///
/// Directional: `added`/`deleted` are relative to `from` -> `to`. Output is
/// sorted by path since manifests iterate in path order.
pub fn diff_manifests(from: &SnapshotManifest, to: &SnapshotManifest) -> ManifestChanges {
    let mut changes = ManifestChanges::default();

    for (path, to_blob) in &to.files {
        match from.files.get(path) {
            Some(from_blob) if from_blob.blob_id != to_blob.blob_id => {
                changes
                    .modified
                    .push((path.clone(), from_blob.clone(), to_blob.clone()));
            }
            Some(_) => {}
            None => changes.added.push(path.clone()),
        }
    }

    for path in from.files.keys() {
        if !to.files.contains_key(path) {
            changes.deleted.push(path.clone());
        }
    }

    changes
}

/// Compute the full diff between two checkpoints
///
/// Resolves both snapshot manifests, classifies the path union, computes a
/// line diff for each modified file within the size cap, and reports the
/// token delta between the two checkpoints' accumulated metadata.
/// `diff(A, A)` is always empty.
pub fn diff_checkpoints(
    store: &SnapshotStore,
    from: &Checkpoint,
    from_manifest: &SnapshotManifest,
    to: &Checkpoint,
    to_manifest: &SnapshotManifest,
    options: &DiffOptions,
) -> Result<CheckpointDiff> {
    debug!(
        "Computing diff between {} and {}",
        from.short_id(),
        to.short_id()
    );

    let changes = diff_manifests(from_manifest, to_manifest);
    let mut modified_files = Vec::with_capacity(changes.modified.len());

    for (path, from_blob, to_blob) in changes.modified {
        if from_blob.size > options.max_file_size || to_blob.size > options.max_file_size {
            modified_files.push(FileDiff {
                path,
                additions: 0,
                deletions: 0,
                diff_content: None,
            });
            continue;
        }

        let from_content = store.read_file(&from_blob.blob_id)?;
        let to_content = store.read_file(&to_blob.blob_id)?;
        modified_files.push(diff_file(&path, &from_content, &to_content, options));
    }

    Ok(CheckpointDiff {
        from_checkpoint_id: from.id.clone(),
        to_checkpoint_id: to.id.clone(),
        modified_files,
        added_files: changes.added,
        deleted_files: changes.deleted,
        token_delta: to.metadata.total_tokens - from.metadata.total_tokens,
    })
}

/// Compute the line-level diff for one modified file
pub fn diff_file(path: &Path, old: &[u8], new: &[u8], options: &DiffOptions) -> FileDiff {
    if is_binary_content(old) || is_binary_content(new) {
        return FileDiff {
            path: path.to_path_buf(),
            additions: 0,
            deletions: 0,
            diff_content: None,
        };
    }

    let old_text = String::from_utf8_lossy(old);
    let new_text = String::from_utf8_lossy(new);
    let old_lines: Vec<&str> = old_text.lines().collect();
    let new_lines: Vec<&str> = new_text.lines().collect();

    let ops = compute_ops(&old_lines, &new_lines);
    let additions = ops.iter().filter(|op| matches!(op, Op::Insert(_))).count();
    let deletions = ops.iter().filter(|op| matches!(op, Op::Delete(_))).count();

    let diff_content = if additions == 0 && deletions == 0 {
        Some(String::new())
    } else {
        Some(render_unified(
            &ops,
            &old_lines,
            &new_lines,
            options.context_lines,
        ))
    };

    FileDiff {
        path: path.to_path_buf(),
        additions,
        deletions,
        diff_content,
    }
}

/// Check if content appears to be binary
pub fn is_binary_content(content: &[u8]) -> bool {
    let check_len = content.len().min(8192);
    content[..check_len].contains(&0)
}

/// One step of the edit script between two line vectors
#[derive(Debug, Clone, Copy)]
enum Op {
    /// Line kept: (old index, new index)
    Keep(usize, usize),
    /// Line removed from the old side
    Delete(usize),
    /// Line inserted on the new side
    Insert(usize),
}

/// Derive the edit script from the LCS of two line vectors
fn compute_ops(old_lines: &[&str], new_lines: &[&str]) -> Vec<Op> {
    if old_lines.is_empty() {
        return (0..new_lines.len()).map(Op::Insert).collect();
    }
    if new_lines.is_empty() {
        return (0..old_lines.len()).map(Op::Delete).collect();
    }

    let lcs = compute_lcs(old_lines, new_lines);

    let mut ops = Vec::new();
    let mut old_idx = 0;
    let mut new_idx = 0;
    for (lcs_old, lcs_new) in lcs {
        while old_idx < lcs_old {
            ops.push(Op::Delete(old_idx));
            old_idx += 1;
        }
        while new_idx < lcs_new {
            ops.push(Op::Insert(new_idx));
            new_idx += 1;
        }
        ops.push(Op::Keep(old_idx, new_idx));
        old_idx += 1;
        new_idx += 1;
    }
    while old_idx < old_lines.len() {
        ops.push(Op::Delete(old_idx));
        old_idx += 1;
    }
    while new_idx < new_lines.len() {
        ops.push(Op::Insert(new_idx));
        new_idx += 1;
    }

    ops
}

/// Longest common subsequence via dynamic programming
fn compute_lcs(old_lines: &[&str], new_lines: &[&str]) -> Vec<(usize, usize)> {
    let m = old_lines.len();
    let n = new_lines.len();

    let mut dp = vec![vec![0usize; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            if old_lines[i - 1] == new_lines[j - 1] {
                dp[i][j] = dp[i - 1][j - 1] + 1;
            } else {
                dp[i][j] = dp[i - 1][j].max(dp[i][j - 1]);
            }
        }
    }

    let mut lcs = Vec::new();
    let mut i = m;
    let mut j = n;
    while i > 0 && j > 0 {
        if old_lines[i - 1] == new_lines[j - 1] {
            lcs.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if dp[i - 1][j] > dp[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }

    lcs.reverse();
    lcs
}

/// Render the edit script as unified-diff hunks
fn render_unified(ops: &[Op], old_lines: &[&str], new_lines: &[&str], context: usize) -> String {
    // An op is part of a hunk when a change sits within `context` positions
    let included: Vec<bool> = (0..ops.len())
        .map(|i| {
            let start = i.saturating_sub(context);
            let end = (i + context + 1).min(ops.len());
            ops[start..end]
                .iter()
                .any(|op| !matches!(op, Op::Keep(_, _)))
        })
        .collect();

    let mut output = String::new();
    let mut old_pos = 0usize;
    let mut new_pos = 0usize;
    let mut i = 0;

    while i < ops.len() {
        if !included[i] {
            match ops[i] {
                Op::Keep(_, _) => {
                    old_pos += 1;
                    new_pos += 1;
                }
                // Changes are always included; excluded ops are keeps
                Op::Delete(_) => old_pos += 1,
                Op::Insert(_) => new_pos += 1,
            }
            i += 1;
            continue;
        }

        // Collect one hunk of consecutive included ops
        let hunk_start = i;
        let from_line = old_pos + 1;
        let to_line = new_pos + 1;
        let mut from_count = 0usize;
        let mut to_count = 0usize;
        let mut body = String::new();

        while i < ops.len() && included[i] {
            match ops[i] {
                Op::Keep(o, _) => {
                    let _ = writeln!(body, " {}", old_lines[o]);
                    old_pos += 1;
                    new_pos += 1;
                    from_count += 1;
                    to_count += 1;
                }
                Op::Delete(o) => {
                    let _ = writeln!(body, "-{}", old_lines[o]);
                    old_pos += 1;
                    from_count += 1;
                }
                Op::Insert(n) => {
                    let _ = writeln!(body, "+{}", new_lines[n]);
                    new_pos += 1;
                    to_count += 1;
                }
            }
            i += 1;
        }

        debug_assert!(i > hunk_start);
        let _ = writeln!(
            output,
            "@@ -{},{} +{},{} @@",
            from_line, from_count, to_line, to_count
        );
        output.push_str(&body);
    }

    output
}
