//! Server-side view of the synchronized tree

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::{ChangeIdGenerator, ChangeKind, ChangeRecord, Direction};
use super::errors::DomainError;
use super::index_entry::IndexEntry;
use super::newtypes::{ContentHash, RelativePath, ServerUid, SyncCounter};

/// One change the server reports since the last cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub path: RelativePath,
    #[serde(default)]
    pub previous_path: Option<RelativePath>,
    pub server_uid: ServerUid,
    #[serde(default)]
    pub parent_uid: Option<ServerUid>,
    pub revision: u64,
    #[serde(default)]
    pub content_hash: Option<ContentHash>,
    #[serde(default)]
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl RemoteChange {
    /// Kind of local change this remote change implies
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        if self.is_deleted {
            ChangeKind::Delete
        } else if self.previous_path.is_some() {
            ChangeKind::Rename
        } else {
            ChangeKind::Modify
        }
    }

    /// Materialize this remote change as a `RemoteToLocal` record
    ///
    /// # Errors
    /// Propagates record validation failures
    pub fn to_change_record(&self, ids: &ChangeIdGenerator) -> Result<ChangeRecord, DomainError> {
        let mut builder =
            ChangeRecord::builder(self.kind(), Direction::RemoteToLocal, self.path.clone())
                .size(self.size)
                .modified_time(self.modified_time)
                .server_revision(self.revision)
                .folder(self.is_folder);
        if let Some(hash) = &self.content_hash {
            builder = builder.content_hash(hash.clone());
        }
        if let (ChangeKind::Rename, Some(prev)) = (self.kind(), &self.previous_path) {
            builder = builder.previous_path(prev.clone());
        }
        builder.build(ids)
    }

    /// Index entry describing the state after this change is applied
    #[must_use]
    pub fn to_index_entry(&self, counter: SyncCounter) -> IndexEntry {
        IndexEntry {
            path: self.path.clone(),
            server_uid: Some(self.server_uid.clone()),
            parent_uid: self.parent_uid.clone(),
            revision: self.revision,
            content_hash: self.content_hash.clone(),
            size: self.size,
            is_folder: self.is_folder,
            is_deleted: self.is_deleted,
            last_sync_counter: counter,
        }
    }
}

/// Batch of remote changes plus the cursor to resume from afterwards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChangeSet {
    pub changes: Vec<RemoteChange>,
    /// Opaque server cursor, committed together with the sync counter
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Server metadata returned after an upload, folder creation or rename
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub path: RelativePath,
    pub server_uid: ServerUid,
    #[serde(default)]
    pub parent_uid: Option<ServerUid>,
    pub revision: u64,
    #[serde(default)]
    pub content_hash: Option<ContentHash>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_folder: bool,
}

impl RemoteItem {
    #[must_use]
    pub fn to_index_entry(&self, counter: SyncCounter) -> IndexEntry {
        IndexEntry {
            path: self.path.clone(),
            server_uid: Some(self.server_uid.clone()),
            parent_uid: self.parent_uid.clone(),
            revision: self.revision,
            content_hash: self.content_hash.clone(),
            size: self.size,
            is_folder: self.is_folder,
            is_deleted: false,
            last_sync_counter: counter,
        }
    }
}
