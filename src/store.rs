//! Content-addressed snapshot storage
//!
//! The store owns every immutable byte in the system: file blobs keyed by
//! SHA-256 of their uncompressed content, snapshot manifests, checkpoint
//! records, and per-session state. Identical content anywhere in the store
//! resolves to the same blob, so snapshots deduplicate across checkpoints
//! and across branches for free.
//!
//! ## Layout
//!
//! ```text
//! store_root/
//! ├── metadata.json                  # Store format version
//! ├── blobs/                         # Content-addressed blobs (sharded)
//! │   └── <prefix>/                  # First 2 chars of hash
//! │       └── <suffix>               # lz4-compressed content
//! └── sessions/
//!     └── <session_id>/
//!         ├── state.json             # Current pointer + settings
//!         └── checkpoints/
//!             └── <checkpoint_id>/
//!                 ├── metadata.json  # Checkpoint record
//!                 └── manifest.bin   # Snapshot manifest (bincode)
//! ```
//!
//! Parent/child edges are not stored on disk; the timeline is rebuilt by
//! indexing checkpoint records on `parent_checkpoint_id`.
//!
//! ## Restore semantics
//!
//! [`SnapshotStore::materialize`] is all-or-nothing: every blob is staged
//! and hash-verified before the live tree is touched, files about to be
//! overwritten or deleted are moved aside, and any failure during the swap
//! rolls the tree back to its pre-call state.

use crate::error::{Result, WaypointError};
use crate::types::{
    BlobId, BlobRef, Checkpoint, SessionState, SnapshotManifest, StoreMetadata,
};
use crate::worktree::ScannedFile;
use chrono::Utc;
use dashmap::DashMap;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

const FORMAT_VERSION: u32 = 1;

/// Content-addressed storage backend
///
/// Thread-safe: blob writes are idempotent (content addressing) and land via
/// temp-file + rename, so concurrent sessions can share one store.
pub struct SnapshotStore {
    /// Root directory of the store
    root: PathBuf,
    /// Uncompressed sizes of blobs known to exist, to skip disk probes
    blob_sizes: DashMap<BlobId, u64>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("root", &self.root)
            .field("known_blobs", &self.blob_sizes.len())
            .finish()
    }
}

/// Outcome of a materialize call
#[derive(Debug, Default)]
pub struct MaterializeReport {
    /// Files written into the destination
    pub files_written: usize,
    /// Tracked files removed because the snapshot does not contain them
    pub files_deleted: usize,
    /// Non-fatal problems (e.g. permissions that could not be applied)
    pub warnings: Vec<String>,
}

impl SnapshotStore {
    /// Initialize a new store at `root`
    ///
    /// Fails with [`WaypointError::StorageAlreadyExists`] if the directory
    /// already contains a store.
    pub fn init(root: PathBuf) -> Result<Self> {
        if root.join("metadata.json").exists() {
            return Err(WaypointError::StorageAlreadyExists(root));
        }

        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("sessions"))?;

        let metadata = StoreMetadata {
            format_version: FORMAT_VERSION,
            waypoint_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
        };
        let metadata_json = serde_json::to_string_pretty(&metadata)?;
        fs::write(root.join("metadata.json"), metadata_json)?;

        info!("Initialized snapshot store at {:?}", root);

        Ok(Self {
            root,
            blob_sizes: DashMap::new(),
        })
    }

    /// Open an existing store
    pub fn open(root: PathBuf) -> Result<Self> {
        let metadata_path = root.join("metadata.json");
        if !metadata_path.exists() {
            return Err(WaypointError::StorageNotInitialized(root));
        }

        let metadata_json = fs::read_to_string(&metadata_path)?;
        let _metadata: StoreMetadata = serde_json::from_str(&metadata_json)?;

        debug!("Opened snapshot store at {:?}", root);

        Ok(Self {
            root,
            blob_sizes: DashMap::new(),
        })
    }

    /// Initialize a new store or open an existing one
    pub fn init_or_open(root: PathBuf) -> Result<Self> {
        if root.join("metadata.json").exists() {
            Self::open(root)
        } else {
            Self::init(root)
        }
    }

    /// Store root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store one file's content, returning its blob id
    ///
    /// Pure with respect to content: identical bytes always yield the same
    /// id, and an existing blob is never rewritten.
    pub fn put_file(&self, path: &Path, content: &[u8]) -> Result<BlobId> {
        let blob_id = hash_bytes(content);

        if self.blob_exists(&blob_id) {
            trace!("Blob {} for {:?} already stored", &blob_id[..8], path);
            return Ok(blob_id);
        }

        let blob_path = self.blob_path(&blob_id);
        let shard_dir = blob_path.parent().expect("sharded blob path has parent");
        fs::create_dir_all(shard_dir)?;

        // Unique temp file + rename keeps concurrent writers of the same
        // content safe: whichever rename lands last wins with identical bytes.
        let compressed = compress_prepend_size(content);
        let mut tmp = tempfile::NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(&compressed)?;
        tmp.persist(&blob_path).map_err(|e| e.error)?;

        self.blob_sizes.insert(blob_id.clone(), content.len() as u64);
        trace!("Stored blob {} ({} bytes raw)", &blob_id[..8], content.len());
        Ok(blob_id)
    }

    /// Load and verify a blob's content
    ///
    /// Fails with [`WaypointError::CorruptSnapshot`] when the decompressed
    /// content no longer hashes to the recorded id.
    pub fn read_file(&self, blob_id: &str) -> Result<Vec<u8>> {
        let blob_path = self.blob_path(blob_id);
        if !blob_path.exists() {
            return Err(WaypointError::BlobNotFound(blob_id.to_string()));
        }

        let compressed = fs::read(&blob_path)?;
        let content = decompress_size_prepended(&compressed)
            .map_err(|e| WaypointError::CorruptSnapshot {
                blob_id: blob_id.to_string(),
                expected: blob_id.to_string(),
                actual: format!("<decompression failed: {}>", e),
            })?;

        let actual = hash_bytes(&content);
        if actual != blob_id {
            return Err(WaypointError::CorruptSnapshot {
                blob_id: blob_id.to_string(),
                expected: blob_id.to_string(),
                actual,
            });
        }

        Ok(content)
    }

    /// Check whether a blob exists
    pub fn blob_exists(&self, blob_id: &str) -> bool {
        self.blob_sizes.contains_key(blob_id) || self.blob_path(blob_id).exists()
    }

    /// Snapshot a scanned working tree into the store
    ///
    /// Stores every file's content via [`SnapshotStore::put_file`] in
    /// parallel and records the resulting path->blob mapping.
    pub fn snapshot(&self, worktree_root: &Path, files: &[ScannedFile]) -> Result<SnapshotManifest> {
        debug!("Snapshotting {} files from {:?}", files.len(), worktree_root);

        let entries: Vec<Result<(PathBuf, BlobRef)>> = files
            .par_iter()
            .map(|file| {
                let full_path = worktree_root.join(&file.path);
                let content = fs::read(&full_path)?;
                let blob_id = self.put_file(&file.path, &content)?;
                Ok((
                    file.path.clone(),
                    BlobRef {
                        blob_id,
                        size: content.len() as u64,
                        mode: file.mode,
                    },
                ))
            })
            .collect();

        let mut manifest_files = BTreeMap::new();
        let mut total_size = 0u64;
        for entry in entries {
            let (path, blob) = entry?;
            total_size += blob.size;
            manifest_files.insert(path, blob);
        }

        Ok(SnapshotManifest {
            files: manifest_files,
            total_size,
            created_at: Utc::now(),
        })
    }

    /// Materialize a snapshot into the working tree, all-or-nothing
    ///
    /// Writes every file in the manifest, removes every path in `tracked`
    /// absent from the manifest, and prunes directories emptied by the
    /// deletions. A blob verification failure aborts before the tree is
    /// touched; a failure during the swap rolls every moved file back.
    pub fn materialize(
        &self,
        manifest: &SnapshotManifest,
        dest: &Path,
        tracked: &[PathBuf],
    ) -> Result<MaterializeReport> {
        debug!(
            "Materializing {} files into {:?}",
            manifest.file_count(),
            dest
        );

        // Phase 1: stage every blob, verifying hashes before anything in
        // the destination moves. CorruptSnapshot surfaces here.
        let staging = tempfile::tempdir_in(&self.root)?;
        for (path, blob) in &manifest.files {
            let content = self.read_file(&blob.blob_id)?;
            let staged = staging.path().join(path);
            if let Some(parent) = staged.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&staged, &content)?;
        }

        // Phase 2: move aside everything the swap will overwrite or delete.
        let backup = tempfile::tempdir_in(&self.root)?;
        let to_delete: Vec<&PathBuf> = tracked
            .iter()
            .filter(|path| !manifest.files.contains_key(*path))
            .collect();

        let mut displaced: Vec<PathBuf> = Vec::new();
        let mut placed: Vec<PathBuf> = Vec::new();

        let swap = (|| -> Result<()> {
            for path in manifest.files.keys().chain(to_delete.iter().copied()) {
                let live = dest.join(path);
                if live.exists() {
                    let saved = backup.path().join(path);
                    if let Some(parent) = saved.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    move_file(&live, &saved)?;
                    displaced.push(path.clone());
                }
            }

            for path in manifest.files.keys() {
                let live = dest.join(path);
                if let Some(parent) = live.parent() {
                    fs::create_dir_all(parent)?;
                }
                move_file(&staging.path().join(path), &live)?;
                placed.push(path.clone());
            }
            Ok(())
        })();

        if let Err(err) = swap {
            warn!("Materialize failed mid-swap, rolling back: {}", err);
            for path in &placed {
                let _ = fs::remove_file(dest.join(path));
            }
            for path in &displaced {
                let live = dest.join(path);
                if let Some(parent) = live.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(e) = move_file(&backup.path().join(path), &live) {
                    warn!("Rollback of {:?} failed: {}", path, e);
                }
            }
            return Err(WaypointError::RestoreFailed(err.to_string()));
        }

        // Swap is complete; apply permissions and prune emptied directories.
        let mut report = MaterializeReport {
            files_written: manifest.file_count(),
            files_deleted: to_delete.len(),
            ..Default::default()
        };

        for (path, blob) in &manifest.files {
            if let Err(e) = set_mode(&dest.join(path), blob.mode) {
                report
                    .warnings
                    .push(format!("Failed to set permissions on {:?}: {}", path, e));
            }
        }

        let mut emptied: Vec<PathBuf> = to_delete
            .iter()
            .filter_map(|path| path.parent().map(|p| dest.join(p)))
            .filter(|dir| dir != dest)
            .collect();
        emptied.sort_by(|a, b| b.components().count().cmp(&a.components().count()));
        emptied.dedup();
        for dir in emptied {
            remove_dir_chain_if_empty(&dir, dest);
        }

        info!(
            "Materialized {} files ({} deleted) into {:?}",
            report.files_written, report.files_deleted, dest
        );
        Ok(report)
    }

    /// Persist a checkpoint record
    pub fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self.checkpoint_dir(&checkpoint.session_id, &checkpoint.id);
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(checkpoint)?;
        fs::write(dir.join("metadata.json"), json)?;

        debug!("Stored checkpoint {}", checkpoint.short_id());
        Ok(())
    }

    /// Load a checkpoint record
    pub fn load_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let path = self
            .checkpoint_dir(session_id, checkpoint_id)
            .join("metadata.json");
        if !path.exists() {
            return Err(WaypointError::CheckpointNotFound(checkpoint_id.to_string()));
        }

        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Persist a checkpoint's snapshot manifest
    pub fn store_manifest(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        manifest: &SnapshotManifest,
    ) -> Result<()> {
        let dir = self.checkpoint_dir(session_id, checkpoint_id);
        fs::create_dir_all(&dir)?;

        let bytes = bincode::serde::encode_to_vec(manifest, bincode::config::standard())?;
        fs::write(dir.join("manifest.bin"), &bytes)?;

        debug!(
            "Stored manifest for checkpoint {} ({} files)",
            &checkpoint_id[..8.min(checkpoint_id.len())],
            manifest.file_count()
        );
        Ok(())
    }

    /// Load a checkpoint's snapshot manifest
    pub fn load_manifest(&self, session_id: &str, checkpoint_id: &str) -> Result<SnapshotManifest> {
        let path = self
            .checkpoint_dir(session_id, checkpoint_id)
            .join("manifest.bin");
        if !path.exists() {
            return Err(WaypointError::CheckpointNotFound(checkpoint_id.to_string()));
        }

        let bytes = fs::read(&path)?;
        let (manifest, _): (SnapshotManifest, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(manifest)
    }

    /// Load every checkpoint record of a session
    ///
    /// Edges are reconstructed by the timeline from `parent_checkpoint_id`;
    /// no ordering is guaranteed here.
    pub fn load_session_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let dir = self.session_dir(session_id).join("checkpoints");
        let mut checkpoints = Vec::new();

        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if !entry.path().is_dir() {
                    continue;
                }
                let id = entry.file_name().to_string_lossy().to_string();
                match self.load_checkpoint(session_id, &id) {
                    Ok(checkpoint) => checkpoints.push(checkpoint),
                    Err(e) => warn!("Skipping unreadable checkpoint {}: {}", id, e),
                }
            }
        }

        Ok(checkpoints)
    }

    /// Delete a checkpoint record and its manifest (blobs are left in place)
    pub fn delete_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<()> {
        let dir = self.checkpoint_dir(session_id, checkpoint_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
            debug!("Deleted checkpoint {}", &checkpoint_id[..8.min(checkpoint_id.len())]);
        }
        Ok(())
    }

    /// Persist session state (current pointer + settings)
    pub fn save_session_state(&self, state: &SessionState) -> Result<()> {
        let dir = self.session_dir(&state.session_id);
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(state)?;
        let path = dir.join("state.json");
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load session state, if the session has any
    pub fn load_session_state(&self, session_id: &str) -> Result<SessionState> {
        let path = self.session_dir(session_id).join("state.json");
        if !path.exists() {
            return Err(WaypointError::SessionNotFound(session_id.to_string()));
        }

        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Aggregate statistics over the whole store
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        let blobs_dir = self.root.join("blobs");
        if blobs_dir.exists() {
            for shard in fs::read_dir(&blobs_dir)? {
                let shard = shard?;
                if !shard.path().is_dir() {
                    continue;
                }
                for blob in fs::read_dir(shard.path())? {
                    let blob = blob?;
                    if blob.path().is_file() {
                        stats.blob_count += 1;
                        stats.compressed_bytes += blob.metadata()?.len();
                    }
                }
            }
        }

        let sessions_dir = self.root.join("sessions");
        if sessions_dir.exists() {
            for session in fs::read_dir(&sessions_dir)? {
                let session = session?;
                if !session.path().is_dir() {
                    continue;
                }
                stats.session_count += 1;
                let checkpoints_dir = session.path().join("checkpoints");
                if checkpoints_dir.exists() {
                    stats.checkpoint_count += fs::read_dir(checkpoints_dir)?
                        .filter_map(|e| e.ok())
                        .filter(|e| e.path().is_dir())
                        .count();
                }
            }
        }

        Ok(stats)
    }

    fn blob_path(&self, blob_id: &str) -> PathBuf {
        let (prefix, suffix) = blob_id.split_at(2.min(blob_id.len()));
        self.root.join("blobs").join(prefix).join(suffix)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(session_id)
    }

    fn checkpoint_dir(&self, session_id: &str, checkpoint_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join("checkpoints")
            .join(checkpoint_id)
    }
}

/// Store-wide statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Unique blobs stored
    pub blob_count: usize,
    /// Compressed bytes on disk across all blobs
    pub compressed_bytes: u64,
    /// Sessions with persisted state
    pub session_count: usize,
    /// Checkpoint records across all sessions
    pub checkpoint_count: usize,
}

/// Compute the blob id (SHA-256 hex) of a byte slice
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Move a file, falling back to copy+remove across filesystems
fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Remove `dir` and its now-empty ancestors, stopping at `stop`
fn remove_dir_chain_if_empty(dir: &Path, stop: &Path) {
    let mut current = dir.to_path_buf();
    while current != stop && current.starts_with(stop) {
        match fs::read_dir(&current) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(_) => break,
        }
        if fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}
