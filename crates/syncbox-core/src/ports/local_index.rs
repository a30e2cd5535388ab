//! Local Index port (driven/secondary port)
//!
//! The Local Index is the single source of truth for what has been
//! synchronized. The Sync Engine consults it before any network action and
//! commits each pass through [`ILocalIndex::record_completed_sync`].
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific;
//!   the engine classifies every failure coming out of this port as a
//!   storage error.
//! - Everything a pass changes travels in one [`CompletedSync`] so the
//!   adapter can apply it in a single transaction.

use std::path::{Path, PathBuf};

use crate::domain::{
    ChangeId, ChangeRecord, ConflictReport, DiffResult, IndexEntry, RelativePath, RemoteChange,
    SyncCounter, SyncId,
};

/// Everything one successful sync pass commits
#[derive(Debug, Clone, Default)]
pub struct CompletedSync {
    pub sync_id: SyncId,
    /// Sync root the index is bound to; a mismatch aborts the commit
    pub root_path: PathBuf,
    /// Change records whose effect is reflected in `entries`
    pub applied_change_ids: Vec<ChangeId>,
    /// Change records dropped without effect (conflict losers, permanent failures)
    pub discarded_change_ids: Vec<ChangeId>,
    /// Entries to upsert
    pub entries: Vec<IndexEntry>,
    pub conflicts: Vec<ConflictReport>,
    /// Remote cursor to resume from next pass; `None` keeps the stored one
    pub remote_cursor: Option<String>,
}

impl CompletedSync {
    #[must_use]
    pub fn new(sync_id: SyncId, root_path: impl Into<PathBuf>) -> Self {
        Self {
            sync_id,
            root_path: root_path.into(),
            ..Self::default()
        }
    }
}

/// Port trait for the durable Local Index
#[async_trait::async_trait]
pub trait ILocalIndex: Send + Sync {
    /// Current sync counter (zero for a new or wiped index)
    async fn sync_counter(&self) -> anyhow::Result<SyncCounter>;

    /// Remote cursor committed by the last pass
    async fn remote_cursor(&self) -> anyhow::Result<Option<String>>;

    /// Sync root the index is bound to, if any pass has committed yet
    async fn root_path(&self) -> anyhow::Result<Option<PathBuf>>;

    async fn get_entry(&self, path: &RelativePath) -> anyhow::Result<Option<IndexEntry>>;

    /// All entries including tombstones, ordered by path
    async fn entries(&self) -> anyhow::Result<Vec<IndexEntry>>;

    /// Entries strictly below `prefix`
    async fn entries_under(&self, prefix: &RelativePath) -> anyhow::Result<Vec<IndexEntry>>;

    /// Persist a queued change record so it survives a restart
    async fn append_change(&self, change: &ChangeRecord) -> anyhow::Result<()>;

    /// Change records neither applied nor discarded, in id order
    async fn pending_changes(&self) -> anyhow::Result<Vec<ChangeRecord>>;

    /// Largest change id ever persisted
    async fn max_change_id(&self) -> anyhow::Result<Option<ChangeId>>;

    /// Compute the pass diff against the current entry set; never mutates
    async fn diff(
        &self,
        remote: &[RemoteChange],
        local: &[ChangeRecord],
    ) -> anyhow::Result<DiffResult>;

    /// Atomically commit a pass and advance the sync counter by one
    ///
    /// Either everything in `completed` becomes visible or nothing does.
    async fn record_completed_sync(&self, completed: &CompletedSync)
        -> anyhow::Result<SyncCounter>;

    /// Conflict reports recorded so far, oldest first
    async fn conflicts(&self) -> anyhow::Result<Vec<ConflictReport>>;

    /// Delete all entries, change log and conflicts; reset the counter to zero
    ///
    /// Must only be called while no engine is running for this index.
    async fn wipe_index(&self, root_path: &Path) -> anyhow::Result<()>;
}
