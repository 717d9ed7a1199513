//! Working-tree enumeration
//!
//! The scanner is the store's view of the live project directory: it decides
//! which files are *tracked*, and therefore which files a snapshot captures
//! and which files a restore is allowed to delete.
//!
//! Scanning is gitignore-aware (via the `ignore` crate), skips hidden files
//! and dependency/build directories, and skips files above a configurable
//! size threshold with a warning rather than an error.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Directories never worth snapshotting, on top of gitignore rules
const DEFAULT_IGNORED_DIRS: &[&str] = &["node_modules", "target"];

/// Default cap on tracked file size (1 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

/// One tracked file discovered by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Path relative to the scanned root
    pub path: PathBuf,
    /// Size in bytes at scan time
    pub size: u64,
    /// Unix permission bits
    pub mode: u32,
}

/// Result of scanning a working tree
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Tracked files, sorted by path
    pub files: Vec<ScannedFile>,
    /// Files skipped with a reason (oversized, unreadable)
    pub warnings: Vec<String>,
}

impl ScanOutcome {
    /// Relative paths of all tracked files
    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Gitignore-aware enumerator for a project working tree
#[derive(Debug, Clone)]
pub struct WorktreeScanner {
    root: PathBuf,
    max_file_size: u64,
    ignored_dirs: Vec<String>,
}

impl WorktreeScanner {
    /// Create a scanner for `root` with default skip rules
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Override the tracked-file size cap (0 disables the cap)
    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Add a directory name to skip during scanning
    pub fn with_ignored_dir(mut self, name: impl Into<String>) -> Self {
        self.ignored_dirs.push(name.into());
        self
    }

    /// Root directory this scanner walks
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate all tracked files under the root
    ///
    /// Hidden entries and gitignored entries are skipped silently; files
    /// above the size cap are skipped with a warning so the caller can
    /// surface them in a [`crate::types::CheckpointResult`].
    pub fn scan(&self) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();

        let ignored_dirs = self.ignored_dirs.clone();
        let walker = ignore::WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .git_global(false)
            .require_git(false)
            .filter_entry(move |entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                    && ignored_dirs.iter().any(|d| d.as_str() == name))
            })
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    outcome.warnings.push(format!("Skipped unreadable entry: {}", e));
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    outcome
                        .warnings
                        .push(format!("Skipped {:?}: {}", entry.path(), e));
                    continue;
                }
            };

            if self.max_file_size > 0 && metadata.len() > self.max_file_size {
                outcome.warnings.push(format!(
                    "Skipped {:?}: {} bytes exceeds limit of {} bytes",
                    entry.path(),
                    metadata.len(),
                    self.max_file_size
                ));
                continue;
            }

            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };

            trace!("Tracked {:?} ({} bytes)", relative, metadata.len());
            outcome.files.push(ScannedFile {
                path: relative,
                size: metadata.len(),
                mode: file_mode(&metadata),
            });
        }

        outcome.files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(
            "Scanned {:?}: {} files, {} warnings",
            self.root,
            outcome.files.len(),
            outcome.warnings.len()
        );
        Ok(outcome)
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}
