//! Last-known-synchronized state of one path

use serde::{Deserialize, Serialize};

use super::newtypes::{ContentHash, RelativePath, ServerUid, SyncCounter};

/// One tracked path as recorded in the Local Index
///
/// Deleted paths are kept as tombstones (`is_deleted = true`) until a later
/// create of the same path supersedes them. This lets the reconciler tell a
/// stale remote delete apart from a resurrection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: RelativePath,
    pub server_uid: Option<ServerUid>,
    pub parent_uid: Option<ServerUid>,
    pub revision: u64,
    pub content_hash: Option<ContentHash>,
    pub size: u64,
    pub is_folder: bool,
    pub is_deleted: bool,
    pub last_sync_counter: SyncCounter,
}

impl IndexEntry {
    /// A live entry with no server identity yet
    #[must_use]
    pub fn new(path: RelativePath, is_folder: bool) -> Self {
        Self {
            path,
            server_uid: None,
            parent_uid: None,
            revision: 0,
            content_hash: None,
            size: 0,
            is_folder,
            is_deleted: false,
            last_sync_counter: SyncCounter::ZERO,
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }

    /// Tombstone for this entry, keeping identity and bumping the revision
    /// when the deleting side reported one
    #[must_use]
    pub fn tombstone(&self, revision: Option<u64>) -> Self {
        Self {
            is_deleted: true,
            revision: revision.unwrap_or(self.revision).max(self.revision),
            ..self.clone()
        }
    }

    /// True when the entry already reflects `hash` as live content
    #[must_use]
    pub fn has_content(&self, hash: Option<&ContentHash>) -> bool {
        self.is_live() && hash.is_some() && self.content_hash.as_ref() == hash
    }
}
