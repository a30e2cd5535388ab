//! Reconciliation diff
//!
//! [`compute_diff`] is a pure function over the Local Index entry set, the
//! remote change list of the current pass and the queued local change
//! records. It decides, per path, which action brings both sides back in
//! agreement.
//!
//! ## Decision table
//!
//! ```text
//!  local pending   remote change   outcome
//!  -------------   -------------   ----------------------------------------
//!  none            delete          delete locally unless stale/unknown
//!  none            rename          rename locally (+ download if content moved)
//!  none            create/modify   download unless the index already has it
//!  change          none            upload / delete / rename remotely, or retire
//!                                  when the index already reflects it
//!  change          change          identical -> adopt remote metadata
//!                                  otherwise resolve_conflict(): newer wins,
//!                                  server wins ties, loser is reported
//! ```

use std::collections::{BTreeMap, HashMap};

use super::change::{ChangeKind, ChangeRecord, Direction};
use super::conflict::{conflict_report, resolve_conflict, ConflictDecision, ConflictReport, ConflictSide};
use super::index_entry::IndexEntry;
use super::newtypes::{ChangeId, RelativePath, SyncCounter};
use super::remote::RemoteChange;

/// A local change scheduled for the server, with the entry it affects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAction {
    pub change: ChangeRecord,
    /// Entry at `change.path`, or at the previous path for renames
    pub entry: Option<IndexEntry>,
}

/// A remote change scheduled for the local tree, with the entry it affects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAction {
    pub change: RemoteChange,
    /// Entry at `change.path`, or at the previous path for renames
    pub entry: Option<IndexEntry>,
}

/// Everything one sync pass has to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub to_upload: Vec<LocalAction>,
    pub to_download: Vec<RemoteAction>,
    pub to_delete_local: Vec<RemoteAction>,
    pub to_delete_remote: Vec<LocalAction>,
    pub to_rename_local: Vec<RemoteAction>,
    pub to_rename_remote: Vec<LocalAction>,
    /// Remote changes whose content the local side already has
    pub adopt: Vec<RemoteAction>,
    pub conflicts: Vec<ConflictReport>,
    /// Local records that need no action (superseded or already reflected)
    pub retired: Vec<ChangeId>,
    /// Local records that lost a conflict
    pub discarded: Vec<ChangeId>,
    /// Remote changes ignored as stale or already applied
    pub skipped_remote: usize,
}

impl DiffResult {
    /// Number of actions that touch either side
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.to_upload.len()
            + self.to_download.len()
            + self.to_delete_local.len()
            + self.to_delete_remote.len()
            + self.to_rename_local.len()
            + self.to_rename_remote.len()
    }

    /// True when neither side needs to change
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.action_count() == 0 && self.adopt.is_empty()
    }

    fn sort(&mut self) {
        // parents before children for creation, children before parents for deletion
        self.to_upload
            .sort_by_key(|a| (!a.change.is_folder(), a.change.path().depth(), a.change.id()));
        self.to_download
            .sort_by_key(|a| (!a.change.is_folder, a.change.path.depth(), a.change.revision));
        self.to_delete_local
            .sort_by_key(|a| std::cmp::Reverse(a.change.path.depth()));
        self.to_delete_remote
            .sort_by_key(|a| std::cmp::Reverse(a.change.path().depth()));
        self.to_rename_remote.sort_by_key(|a| a.change.id());
        self.to_rename_local.sort_by_key(|a| a.change.revision);
        self.retired.sort();
        self.retired.dedup();
        self.discarded.sort();
    }
}

/// Compute the actions of one pass
///
/// Never mutates anything; the same inputs always produce the same result.
#[must_use]
pub fn compute_diff(
    entries: &[IndexEntry],
    remote: &[RemoteChange],
    local: &[ChangeRecord],
) -> DiffResult {
    let index: HashMap<&RelativePath, &IndexEntry> =
        entries.iter().map(|e| (&e.path, e)).collect();
    let mut result = DiffResult::default();

    // Latest remote change per path; the listing may report several.
    let mut remote_by_path: BTreeMap<RelativePath, RemoteChange> = BTreeMap::new();
    for change in remote {
        match remote_by_path.get(&change.path) {
            Some(existing) if existing.revision > change.revision => result.skipped_remote += 1,
            Some(_) => {
                result.skipped_remote += 1;
                remote_by_path.insert(change.path.clone(), change.clone());
            }
            None => {
                remote_by_path.insert(change.path.clone(), change.clone());
            }
        }
    }

    let mut local_by_path: BTreeMap<RelativePath, Vec<&ChangeRecord>> = BTreeMap::new();
    for change in local {
        if change.direction() == Direction::LocalToRemote {
            local_by_path
                .entry(change.path().clone())
                .or_default()
                .push(change);
        } else {
            result.retired.push(change.id());
        }
    }

    for (path, mut group) in local_by_path {
        group.sort_by_key(|c| c.id());
        let Some((latest, superseded)) = group.split_last() else {
            continue;
        };

        for older in superseded {
            if older.kind() == ChangeKind::Rename {
                plan_local(older, &index, &mut result);
            } else {
                result.retired.push(older.id());
            }
        }

        match remote_by_path.remove(&path) {
            None => plan_local(latest, &index, &mut result),
            Some(remote) => plan_conflict(latest, remote, &index, &mut result),
        }
    }

    for remote in remote_by_path.into_values() {
        plan_remote(remote, &index, &mut result);
    }

    result.sort();
    result
}

fn plan_local(change: &ChangeRecord, index: &HashMap<&RelativePath, &IndexEntry>, result: &mut DiffResult) {
    let entry = index.get(change.path()).copied();
    match change.kind() {
        ChangeKind::Delete => match entry {
            Some(e) if e.is_live() => result.to_delete_remote.push(LocalAction {
                change: change.clone(),
                entry: Some(e.clone()),
            }),
            _ => result.retired.push(change.id()),
        },
        ChangeKind::Rename => {
            let previous = change
                .previous_path()
                .and_then(|p| index.get(p).copied())
                .filter(|e| e.is_live());
            match previous {
                Some(prev) => {
                    let content_moved = !change.is_folder()
                        && change.content_hash().is_some()
                        && prev.content_hash.as_ref() != change.content_hash();
                    result.to_rename_remote.push(LocalAction {
                        change: change.clone(),
                        entry: Some(prev.clone()),
                    });
                    if content_moved {
                        result.to_upload.push(LocalAction {
                            change: change.with_kind(ChangeKind::Modify),
                            entry: None,
                        });
                    }
                }
                // echo of a rename this client applied from the server
                None if entry.is_some_and(|e| reflects(e, change)) => {
                    result.retired.push(change.id());
                }
                // never synced under the old name: upload as a new item
                None => result.to_upload.push(LocalAction {
                    change: change.with_kind(ChangeKind::Create),
                    entry: entry.cloned(),
                }),
            }
        }
        ChangeKind::Create | ChangeKind::Modify | ChangeKind::MetadataOnly => {
            if entry.is_some_and(|e| reflects(e, change)) {
                result.retired.push(change.id());
            } else {
                result.to_upload.push(LocalAction {
                    change: change.clone(),
                    entry: entry.cloned(),
                });
            }
        }
    }
}

/// True when `entry` already holds what `change` describes
fn reflects(entry: &IndexEntry, change: &ChangeRecord) -> bool {
    if change.is_folder() {
        entry.is_live() && entry.is_folder
    } else {
        entry.has_content(change.content_hash())
    }
}

fn plan_remote(remote: RemoteChange, index: &HashMap<&RelativePath, &IndexEntry>, result: &mut DiffResult) {
    let entry = index.get(&remote.path).copied();

    if remote.is_deleted {
        match entry {
            Some(e) if e.is_live() && e.revision <= remote.revision => {
                result.to_delete_local.push(RemoteAction {
                    change: remote,
                    entry: Some(e.clone()),
                });
            }
            // unknown path, tombstone, or a resurrected entry newer than the delete
            _ => result.skipped_remote += 1,
        }
        return;
    }

    if let Some(previous) = remote
        .previous_path
        .as_ref()
        .and_then(|p| index.get(p).copied())
        .filter(|e| e.is_live())
    {
        let content_moved = !remote.is_folder && !previous.has_content(remote.content_hash.as_ref());
        if content_moved {
            result.to_download.push(RemoteAction {
                change: RemoteChange {
                    previous_path: None,
                    ..remote.clone()
                },
                entry: None,
            });
        }
        result.to_rename_local.push(RemoteAction {
            change: remote,
            entry: Some(previous.clone()),
        });
        return;
    }

    let remote = RemoteChange {
        previous_path: None,
        ..remote
    };
    match entry {
        Some(e) if e.is_deleted && e.revision >= remote.revision => result.skipped_remote += 1,
        // no hash to compare; the revision alone says we already hold it
        Some(e)
            if e.is_live()
                && !e.is_folder
                && !remote.is_folder
                && remote.content_hash.is_none()
                && e.revision >= remote.revision =>
        {
            result.skipped_remote += 1;
        }
        Some(e) if e.is_live() && same_content(e, &remote) => {
            if e.revision >= remote.revision {
                result.skipped_remote += 1;
            } else {
                result.adopt.push(RemoteAction {
                    change: remote,
                    entry: Some(e.clone()),
                });
            }
        }
        _ => result.to_download.push(RemoteAction {
            change: remote,
            entry: entry.cloned(),
        }),
    }
}

fn plan_conflict(
    local: &ChangeRecord,
    remote: RemoteChange,
    index: &HashMap<&RelativePath, &IndexEntry>,
    result: &mut DiffResult,
) {
    match resolve_conflict(local, &remote) {
        ConflictDecision::Identical => {
            result.retired.push(local.id());
            let entry = index.get(&remote.path).map(|e| (*e).clone());
            result.adopt.push(RemoteAction {
                change: remote,
                entry,
            });
        }
        ConflictDecision::LocalWins => {
            result
                .conflicts
                .push(conflict_report(local, &remote, ConflictSide::Local));
            plan_local_over_remote(local, &remote, index, result);
        }
        ConflictDecision::RemoteWins => {
            result
                .conflicts
                .push(conflict_report(local, &remote, ConflictSide::Remote));
            result.discarded.push(local.id());
            plan_remote(remote, index, result);
        }
    }
}

/// Local change that beat a remote change: apply it against the server's
/// current identity for the path rather than the stale index entry
fn plan_local_over_remote(
    local: &ChangeRecord,
    remote: &RemoteChange,
    index: &HashMap<&RelativePath, &IndexEntry>,
    result: &mut DiffResult,
) {
    let remote_entry = (!remote.is_deleted).then(|| remote.to_index_entry(SyncCounter::ZERO));
    match local.kind() {
        ChangeKind::Delete => match remote_entry {
            Some(entry) => result.to_delete_remote.push(LocalAction {
                change: local.clone(),
                entry: Some(entry),
            }),
            None => result.retired.push(local.id()),
        },
        ChangeKind::Rename => plan_local(local, index, result),
        ChangeKind::Create | ChangeKind::Modify | ChangeKind::MetadataOnly => {
            let change = if remote.is_deleted {
                local.with_kind(ChangeKind::Create)
            } else {
                local.clone()
            };
            result.to_upload.push(LocalAction {
                change,
                entry: remote_entry,
            });
        }
    }
}

fn same_content(entry: &IndexEntry, remote: &RemoteChange) -> bool {
    if entry.is_folder || remote.is_folder {
        return entry.is_folder && remote.is_folder;
    }
    entry.has_content(remote.content_hash.as_ref())
}
