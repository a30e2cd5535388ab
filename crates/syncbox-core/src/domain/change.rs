//! Change records
//!
//! A [`ChangeRecord`] describes one filesystem delta pending application,
//! either a local edit that must reach the server or a remote edit that must
//! reach the local tree. Records are immutable: a later edit to the same
//! path produces a new record with a larger [`ChangeId`] that supersedes the
//! queued one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ChangeId, ContentHash, RelativePath};

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Rename,
    /// Timestamps or attributes changed, content did not
    MetadataOnly,
}

impl ChangeKind {
    /// Stable name used for persistence
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::MetadataOnly => "metadata_only",
        }
    }

    /// Parse the persisted name
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` for unknown names
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "create" => Ok(Self::Create),
            "modify" => Ok(Self::Modify),
            "delete" => Ok(Self::Delete),
            "rename" => Ok(Self::Rename),
            "metadata_only" => Ok(Self::MetadataOnly),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown change kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side a change must be propagated to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local edit, apply on the server
    LocalToRemote,
    /// Server edit, apply on the local tree
    RemoteToLocal,
}

impl Direction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalToRemote => "local_to_remote",
            Self::RemoteToLocal => "remote_to_local",
        }
    }

    /// Parse the persisted name
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` for unknown names
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "local_to_remote" => Ok(Self::LocalToRemote),
            "remote_to_local" => Ok(Self::RemoteToLocal),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown direction: {other}"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one filesystem delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    id: ChangeId,
    path: RelativePath,
    kind: ChangeKind,
    direction: Direction,
    previous_path: Option<RelativePath>,
    content_hash: Option<ContentHash>,
    size: u64,
    modified_time: DateTime<Utc>,
    server_revision: Option<u64>,
    is_folder: bool,
}

impl ChangeRecord {
    /// Start building a record for `path`
    #[must_use]
    pub fn builder(kind: ChangeKind, direction: Direction, path: RelativePath) -> ChangeRecordBuilder {
        ChangeRecordBuilder {
            path,
            kind,
            direction,
            previous_path: None,
            content_hash: None,
            size: 0,
            modified_time: Utc::now(),
            server_revision: None,
            is_folder: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> ChangeId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &RelativePath {
        &self.path
    }

    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub fn previous_path(&self) -> Option<&RelativePath> {
        self.previous_path.as_ref()
    }

    #[must_use]
    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn modified_time(&self) -> DateTime<Utc> {
        self.modified_time
    }

    #[must_use]
    pub fn server_revision(&self) -> Option<u64> {
        self.server_revision
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    /// True for kinds that carry new file content
    #[must_use]
    pub fn carries_content(&self) -> bool {
        matches!(self.kind, ChangeKind::Create | ChangeKind::Modify) && !self.is_folder
    }

    /// A copy of this record with a different kind, keeping the same id
    ///
    /// Used by the delay processor when coalescing pending records, before
    /// the record is handed to the engine.
    #[must_use]
    pub fn with_kind(&self, kind: ChangeKind) -> Self {
        Self {
            kind,
            previous_path: if kind == ChangeKind::Rename {
                self.previous_path.clone()
            } else {
                None
            },
            ..self.clone()
        }
    }

    /// This record's state as a rename from `previous`, keeping the id
    ///
    /// Renaming back onto the same path degrades to a `Modify`.
    #[must_use]
    pub fn renamed_from(&self, previous: RelativePath) -> Self {
        if previous == self.path {
            return self.with_kind(ChangeKind::Modify);
        }
        Self {
            kind: ChangeKind::Rename,
            previous_path: Some(previous),
            ..self.clone()
        }
    }

    /// A delete of `path` carrying this record's id and timestamp
    #[must_use]
    pub fn deleted_at(&self, path: RelativePath) -> Self {
        Self {
            path,
            kind: ChangeKind::Delete,
            previous_path: None,
            content_hash: None,
            size: 0,
            ..self.clone()
        }
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.previous_path {
            Some(prev) => write!(
                f,
                "{} {} {} -> {} ({})",
                self.id, self.kind, prev, self.path, self.direction
            ),
            None => write!(
                f,
                "{} {} {} ({})",
                self.id, self.kind, self.path, self.direction
            ),
        }
    }
}

/// Builder for [`ChangeRecord`]; the id is assigned last by a generator
#[derive(Debug, Clone)]
pub struct ChangeRecordBuilder {
    path: RelativePath,
    kind: ChangeKind,
    direction: Direction,
    previous_path: Option<RelativePath>,
    content_hash: Option<ContentHash>,
    size: u64,
    modified_time: DateTime<Utc>,
    server_revision: Option<u64>,
    is_folder: bool,
}

impl ChangeRecordBuilder {
    #[must_use]
    pub fn previous_path(mut self, previous: RelativePath) -> Self {
        self.previous_path = Some(previous);
        self
    }

    #[must_use]
    pub fn content_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn modified_time(mut self, time: DateTime<Utc>) -> Self {
        self.modified_time = time;
        self
    }

    #[must_use]
    pub fn server_revision(mut self, revision: u64) -> Self {
        self.server_revision = Some(revision);
        self
    }

    #[must_use]
    pub fn folder(mut self, is_folder: bool) -> Self {
        self.is_folder = is_folder;
        self
    }

    /// Finish the record with an id from `ids`
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` when a rename has no previous
    /// path, or a non-rename carries one.
    pub fn build(self, ids: &ChangeIdGenerator) -> Result<ChangeRecord, DomainError> {
        self.validate()?;
        Ok(self.finish(ids.next_id()))
    }

    /// Finish the record with an id loaded from persistent storage
    ///
    /// # Errors
    /// Same validation as [`build`](Self::build)
    pub fn restore(self, id: ChangeId) -> Result<ChangeRecord, DomainError> {
        self.validate()?;
        Ok(self.finish(id))
    }

    fn validate(&self) -> Result<(), DomainError> {
        match (self.kind, &self.previous_path) {
            (ChangeKind::Rename, None) => Err(DomainError::ValidationFailed(format!(
                "Rename of {} has no previous path",
                self.path
            ))),
            (ChangeKind::Rename, Some(prev)) if *prev == self.path => {
                Err(DomainError::ValidationFailed(format!(
                    "Rename of {} onto itself",
                    self.path
                )))
            }
            (kind, Some(_)) if kind != ChangeKind::Rename => Err(DomainError::ValidationFailed(
                format!("{} of {} cannot carry a previous path", kind, self.path),
            )),
            _ => Ok(()),
        }
    }

    fn finish(self, id: ChangeId) -> ChangeRecord {
        ChangeRecord {
            id,
            path: self.path,
            kind: self.kind,
            direction: self.direction,
            previous_path: self.previous_path,
            content_hash: self.content_hash,
            size: self.size,
            modified_time: self.modified_time,
            server_revision: self.server_revision,
            is_folder: self.is_folder,
        }
    }
}

/// Hands out strictly increasing [`ChangeId`]s
///
/// Shared between the monitor and the engine; seed it with the largest id
/// found in the persisted change log so ids keep increasing after restart.
#[derive(Debug)]
pub struct ChangeIdGenerator {
    last: AtomicU64,
}

impl ChangeIdGenerator {
    /// Generator whose first id is `last + 1`
    #[must_use]
    pub fn starting_after(last: Option<ChangeId>) -> Self {
        Self {
            last: AtomicU64::new(last.map_or(0, |id| id.value())),
        }
    }

    /// Next id, strictly greater than every id returned before
    pub fn next_id(&self) -> ChangeId {
        ChangeId::new(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Raise the floor so future ids exceed `seen`
    pub fn observe(&self, seen: ChangeId) {
        self.last.fetch_max(seen.value(), Ordering::SeqCst);
    }
}

impl Default for ChangeIdGenerator {
    fn default() -> Self {
        Self::starting_after(None)
    }
}
