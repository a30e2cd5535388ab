//! Conflict resolution between a pending local change and a remote change
//!
//! A conflict exists when the same path has a queued local change and a
//! server-reported change since the last sync counter. Resolution compares
//! version markers: the side with the strictly newer marker wins, and on an
//! exact tie the server wins. The losing change is discarded and reported,
//! never retried.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::{ChangeKind, ChangeRecord};
use super::errors::SyncError;
use super::newtypes::{ChangeId, RelativePath};
use super::remote::RemoteChange;

/// Ordering key of one side of a conflict
///
/// Compared by modification time first, then revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionMarker {
    pub modified_time: DateTime<Utc>,
    pub revision: u64,
}

impl VersionMarker {
    /// Marker of a local change; its revision is the server revision the
    /// edit was based on
    #[must_use]
    pub fn of_local(change: &ChangeRecord) -> Self {
        Self {
            modified_time: change.modified_time(),
            revision: change.server_revision().unwrap_or(0),
        }
    }

    #[must_use]
    pub fn of_remote(change: &RemoteChange) -> Self {
        Self {
            modified_time: change.modified_time,
            revision: change.revision,
        }
    }
}

/// Which side of a conflict prevailed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSide {
    Local,
    Remote,
}

impl ConflictSide {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Outcome of comparing both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Both sides hold the same content; only metadata needs refreshing
    Identical,
    /// The local change is applied, the remote change is dropped
    LocalWins,
    /// The remote change is applied, the local change is discarded
    RemoteWins,
}

/// Record of a resolved conflict, surfaced to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub path: RelativePath,
    pub winner: ConflictSide,
    pub local_change_id: ChangeId,
    pub local_kind: ChangeKind,
    pub local_marker: VersionMarker,
    pub remote_marker: VersionMarker,
    pub remote_deleted: bool,
    pub detected_at: DateTime<Utc>,
}

impl ConflictReport {
    /// Short explanation of why the winner won
    #[must_use]
    pub fn reason(&self) -> String {
        match (self.winner, self.local_marker.cmp(&self.remote_marker)) {
            (ConflictSide::Local, _) => "local change is newer".to_string(),
            (ConflictSide::Remote, Ordering::Equal) => {
                "identical version markers, server wins the tie".to_string()
            }
            (ConflictSide::Remote, _) => "remote change is newer".to_string(),
        }
    }

    /// The report expressed in the sync error taxonomy
    #[must_use]
    pub fn to_error(&self) -> SyncError {
        SyncError::Conflict {
            path: self.path.to_string(),
            reason: self.reason(),
        }
    }
}

/// Decide which side of a same-path change pair is applied
#[must_use]
pub fn resolve_conflict(local: &ChangeRecord, remote: &RemoteChange) -> ConflictDecision {
    if same_content(local, remote) {
        return ConflictDecision::Identical;
    }

    if VersionMarker::of_local(local) > VersionMarker::of_remote(remote) {
        ConflictDecision::LocalWins
    } else {
        ConflictDecision::RemoteWins
    }
}

/// Build the report for a decided conflict
#[must_use]
pub fn conflict_report(
    local: &ChangeRecord,
    remote: &RemoteChange,
    winner: ConflictSide,
) -> ConflictReport {
    ConflictReport {
        path: local.path().clone(),
        winner,
        local_change_id: local.id(),
        local_kind: local.kind(),
        local_marker: VersionMarker::of_local(local),
        remote_marker: VersionMarker::of_remote(remote),
        remote_deleted: remote.is_deleted,
        detected_at: Utc::now(),
    }
}

fn same_content(local: &ChangeRecord, remote: &RemoteChange) -> bool {
    let local_deleted = local.kind() == ChangeKind::Delete;
    if local_deleted || remote.is_deleted {
        return local_deleted && remote.is_deleted;
    }
    if local.is_folder() || remote.is_folder {
        return local.is_folder() && remote.is_folder;
    }
    match (local.content_hash(), remote.content_hash.as_ref()) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}
