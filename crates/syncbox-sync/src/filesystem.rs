//! Local tree operations
//!
//! [`LocalTree`] is the engine's handle on the synchronized folder: it maps
//! [`RelativePath`]s to absolute paths, stats and hashes files, walks the tree
//! for the initial index, and applies remote folder/delete/rename changes.
//!
//! ## Design Decisions
//!
//! - **Partial downloads**: content is streamed to `<target>.syncbox-partial`
//!   and renamed into place, so a crash never leaves a torn file. Partial
//!   files are invisible to the walker and the monitor.
//! - **SHA-256**: content hashes are lowercase hex SHA-256, computed in
//!   fixed-size chunks so large files are never held in memory.
//! - **Exclusions**: the index database (and its `-wal`/`-shm` siblings) may
//!   live inside the root; excluded prefixes are skipped everywhere.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use syncbox_core::domain::{ContentHash, RelativePath};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use crate::FsError;

pub use syncbox_core::ports::{partial_path, PARTIAL_SUFFIX};

const HASH_CHUNK: usize = 64 * 1024;

/// Lowercase hex SHA-256 of a file's content
#[instrument(level = "debug")]
pub async fn hash_file(path: &Path) -> Result<ContentHash, FsError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FsError::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hex = format!("{:x}", hasher.finalize());
    Ok(ContentHash::new(hex)?)
}

// ============================================================================
// LocalTree
// ============================================================================

/// What the file system says about one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState {
    pub is_folder: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// One item found by [`LocalTree::walk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: RelativePath,
    pub state: LocalState,
}

/// The synchronized folder on disk
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
    excluded: Vec<PathBuf>,
}

impl LocalTree {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: Vec::new(),
        }
    }

    /// Never report or touch paths starting with `prefix`
    #[must_use]
    pub fn with_excluded(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.excluded.push(prefix.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, path: &RelativePath) -> PathBuf {
        path.to_local(&self.root)
    }

    /// True for partial downloads and excluded prefixes
    pub fn is_ignored(&self, path: &Path) -> bool {
        if path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .unwrap_or(false)
        {
            return true;
        }
        let raw = path.to_string_lossy();
        self.excluded
            .iter()
            .any(|prefix| raw.starts_with(prefix.to_string_lossy().as_ref()))
    }

    /// Relative form of an absolute path, `None` if ignored or outside the root
    pub fn relative(&self, path: &Path) -> Option<RelativePath> {
        if self.is_ignored(path) {
            return None;
        }
        RelativePath::from_local(&self.root, path).ok()
    }

    /// Stat a path; `None` if it does not exist
    pub async fn stat(&self, path: &RelativePath) -> Result<Option<LocalState>, FsError> {
        stat_absolute(&self.absolute(path)).await
    }

    pub async fn hash(&self, path: &RelativePath) -> Result<ContentHash, FsError> {
        hash_file(&self.absolute(path)).await
    }

    #[instrument(skip(self), fields(path = %path))]
    pub async fn create_dir(&self, path: &RelativePath) -> Result<(), FsError> {
        let target = self.absolute(path);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| FsError::from_io(&target, e))?;
        debug!("directory created");
        Ok(())
    }

    /// Remove a file or a whole folder; a missing path is already removed
    #[instrument(skip(self), fields(path = %path))]
    pub async fn remove(&self, path: &RelativePath) -> Result<(), FsError> {
        let target = self.absolute(path);
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("already absent");
                return Ok(());
            }
            Err(e) => return Err(FsError::from_io(&target, e)),
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(()) => {
                debug!(is_folder = metadata.is_dir(), "removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::from_io(&target, e)),
        }
    }

    /// Move `from` to `to`, creating the destination's parent
    #[instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn rename(&self, from: &RelativePath, to: &RelativePath) -> Result<(), FsError> {
        let source = self.absolute(from);
        let target = self.absolute(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::from_io(parent, e))?;
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| FsError::from_io(&source, e))?;
        debug!("renamed");
        Ok(())
    }

    /// Every file and folder below the root, sorted by path
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn walk(&self) -> Result<Vec<LocalEntry>, FsError> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| FsError::from_io(&dir, e))?;
            while let Some(entry) = entries.next_entry().await? {
                let abs = entry.path();
                let Some(path) = self.relative(&abs) else {
                    continue;
                };
                let file_type = entry.file_type().await?;
                if file_type.is_symlink() {
                    debug!(path = %path, "skipping symlink");
                    continue;
                }
                // Vanished between listing and stat
                let Some(state) = stat_absolute(&abs).await? else {
                    continue;
                };
                if state.is_folder {
                    pending.push(abs);
                }
                found.push(LocalEntry { path, state });
            }
        }

        found.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(entries = found.len(), "walk complete");
        Ok(found)
    }
}

async fn stat_absolute(path: &Path) -> Result<Option<LocalState>, FsError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FsError::from_io(path, e)),
    };
    let modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(Some(LocalState {
        is_folder: metadata.is_dir(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified,
    }))
}
