//! SQLite implementation of ILocalIndex
//!
//! Holds the last synchronized state of every path, the change log and the
//! sync counter. [`SqliteLocalIndex::record_completed_sync`] applies a whole
//! pass inside one transaction: the counter bump is the first write, so two
//! concurrent commits serialize on SQLite's write lock instead of both
//! reading the same counter.
//!
//! ## Type Mapping
//!
//! | Domain Type          | SQL Type | Strategy                    |
//! |----------------------|----------|-----------------------------|
//! | RelativePath         | TEXT     | String via `.as_str()` / `RelativePath::new()` |
//! | ServerUid            | TEXT     | String via `.as_str()` / `ServerUid::new()` |
//! | ContentHash          | TEXT     | String via `.as_str()` / `ContentHash::new()` |
//! | ChangeId, counters   | INTEGER  | `u64` stored as `i64`       |
//! | ChangeKind/Direction | TEXT     | `.as_str()` / `parse()`     |
//! | DateTime<Utc>        | TEXT     | ISO 8601 via `to_rfc3339()` |
//! | ConflictReport       | TEXT     | serde_json serialization    |

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use syncbox_core::domain::{
    compute_diff, ChangeId, ChangeKind, ChangeRecord, ConflictReport, ContentHash, DiffResult,
    Direction, IndexEntry, RelativePath, RemoteChange, ServerUid, SyncCounter,
};
use syncbox_core::ports::{CompletedSync, ILocalIndex};

use crate::CacheError;

/// SQLite-based implementation of the Local Index port
pub struct SqliteLocalIndex {
    pool: SqlitePool,
}

impl SqliteLocalIndex {
    /// Creates a new index over the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Conversion helpers
// ============================================================================

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn parse_path(s: String) -> Result<RelativePath, CacheError> {
    RelativePath::new(s).map_err(|e| CacheError::SerializationError(e.to_string()))
}

fn parse_uid(s: Option<String>) -> Result<Option<ServerUid>, CacheError> {
    s.map(ServerUid::new)
        .transpose()
        .map_err(|e| CacheError::SerializationError(e.to_string()))
}

fn parse_hash(s: Option<String>) -> Result<Option<ContentHash>, CacheError> {
    s.map(ContentHash::new)
        .transpose()
        .map_err(|e| CacheError::SerializationError(e.to_string()))
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn entry_from_row(row: &SqliteRow) -> Result<IndexEntry, CacheError> {
    Ok(IndexEntry {
        path: parse_path(row.get("path"))?,
        server_uid: parse_uid(row.get("server_uid"))?,
        parent_uid: parse_uid(row.get("parent_uid"))?,
        revision: to_u64(row.get("revision")),
        content_hash: parse_hash(row.get("content_hash"))?,
        size: to_u64(row.get("size")),
        is_folder: row.get("is_folder"),
        is_deleted: row.get("is_deleted"),
        last_sync_counter: SyncCounter::new(to_u64(row.get("last_sync_counter"))),
    })
}

fn change_from_row(row: &SqliteRow) -> Result<ChangeRecord, CacheError> {
    let id = ChangeId::new(to_u64(row.get("id")));
    let kind_str: String = row.get("kind");
    let direction_str: String = row.get("direction");
    let kind =
        ChangeKind::parse(&kind_str).map_err(|e| CacheError::SerializationError(e.to_string()))?;
    let direction = Direction::parse(&direction_str)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;

    let mut builder = ChangeRecord::builder(kind, direction, parse_path(row.get("path"))?)
        .size(to_u64(row.get("size")))
        .modified_time(parse_datetime(row.get("modified_time"))?)
        .folder(row.get("is_folder"));

    let previous: Option<String> = row.get("previous_path");
    if let Some(previous) = previous {
        builder = builder.previous_path(parse_path(previous)?);
    }
    if let Some(hash) = parse_hash(row.get("content_hash"))? {
        builder = builder.content_hash(hash);
    }
    let revision: Option<i64> = row.get("server_revision");
    if let Some(revision) = revision {
        builder = builder.server_revision(to_u64(revision));
    }

    builder
        .restore(id)
        .map_err(|e| CacheError::SerializationError(format!("Change {}: {}", id, e)))
}

fn conflict_from_row(row: &SqliteRow) -> Result<ConflictReport, CacheError> {
    let report: String = row.get("report");
    serde_json::from_str(&report).map_err(|e| {
        CacheError::SerializationError(format!("Failed to deserialize conflict report: {}", e))
    })
}

// ============================================================================
// Transaction steps
// ============================================================================

async fn upsert_entry(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &IndexEntry,
    counter: SyncCounter,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO index_entries \
         (path, server_uid, parent_uid, revision, content_hash, size, is_folder, \
          is_deleted, last_sync_counter) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(path) DO UPDATE SET \
            server_uid = excluded.server_uid, \
            parent_uid = excluded.parent_uid, \
            revision = excluded.revision, \
            content_hash = excluded.content_hash, \
            size = excluded.size, \
            is_folder = excluded.is_folder, \
            is_deleted = excluded.is_deleted, \
            last_sync_counter = MAX(index_entries.last_sync_counter, excluded.last_sync_counter)",
    )
    .bind(entry.path.as_str())
    .bind(entry.server_uid.as_ref().map(ServerUid::as_str))
    .bind(entry.parent_uid.as_ref().map(ServerUid::as_str))
    .bind(to_i64(entry.revision))
    .bind(entry.content_hash.as_ref().map(ContentHash::as_str))
    .bind(to_i64(entry.size))
    .bind(entry.is_folder)
    .bind(entry.is_deleted)
    .bind(to_i64(counter.value()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn retire_change(
    tx: &mut Transaction<'_, Sqlite>,
    id: ChangeId,
    status: &str,
    counter: SyncCounter,
) -> Result<(), CacheError> {
    let result = sqlx::query(
        "UPDATE change_log SET status = ?, retired_sync_counter = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(status)
    .bind(to_i64(counter.value()))
    .bind(to_i64(id.value()))
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CacheError::UnknownChange(id.to_string()));
    }
    Ok(())
}

#[async_trait::async_trait]
impl ILocalIndex for SqliteLocalIndex {
    async fn sync_counter(&self) -> anyhow::Result<SyncCounter> {
        let counter: i64 = sqlx::query_scalar("SELECT sync_counter FROM sync_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(SyncCounter::new(to_u64(counter)))
    }

    async fn remote_cursor(&self) -> anyhow::Result<Option<String>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT remote_cursor FROM sync_state WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(cursor)
    }

    async fn root_path(&self) -> anyhow::Result<Option<PathBuf>> {
        let root: Option<String> =
            sqlx::query_scalar("SELECT root_path FROM sync_state WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(root.map(PathBuf::from))
    }

    async fn get_entry(&self, path: &RelativePath) -> anyhow::Result<Option<IndexEntry>> {
        let row = sqlx::query("SELECT * FROM index_entries WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(entry_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn entries(&self) -> anyhow::Result<Vec<IndexEntry>> {
        let rows = sqlx::query("SELECT * FROM index_entries ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;

        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn entries_under(&self, prefix: &RelativePath) -> anyhow::Result<Vec<IndexEntry>> {
        // substr() compares characters, which sidesteps LIKE wildcard escaping
        let needle = format!("{}/", prefix.as_str());
        let rows = sqlx::query(
            "SELECT * FROM index_entries WHERE substr(path, 1, ?) = ? ORDER BY path ASC",
        )
        .bind(needle.chars().count() as i64)
        .bind(&needle)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn append_change(&self, change: &ChangeRecord) -> anyhow::Result<()> {
        let id = to_i64(change.id().value());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO change_log \
             (id, path, kind, direction, previous_path, content_hash, size, \
              modified_time, server_revision, is_folder, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending') \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(change.path().as_str())
        .bind(change.kind().as_str())
        .bind(change.direction().as_str())
        .bind(change.previous_path().map(RelativePath::as_str))
        .bind(change.content_hash().map(ContentHash::as_str))
        .bind(to_i64(change.size()))
        .bind(change.modified_time().to_rfc3339())
        .bind(change.server_revision().map(to_i64))
        .bind(change.is_folder())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sync_state SET last_change_id = MAX(last_change_id, ?) WHERE id = 1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::trace!(change_id = %change.id(), path = %change.path(), "Appended change record");
        Ok(())
    }

    async fn pending_changes(&self) -> anyhow::Result<Vec<ChangeRecord>> {
        let rows = sqlx::query("SELECT * FROM change_log WHERE status = 'pending' ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let changes = rows
            .iter()
            .map(change_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(changes)
    }

    async fn max_change_id(&self) -> anyhow::Result<Option<ChangeId>> {
        let last: i64 = sqlx::query_scalar("SELECT last_change_id FROM sync_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok((last > 0).then(|| ChangeId::new(to_u64(last))))
    }

    async fn diff(
        &self,
        remote: &[RemoteChange],
        local: &[ChangeRecord],
    ) -> anyhow::Result<DiffResult> {
        let entries = self.entries().await?;
        Ok(compute_diff(&entries, remote, local))
    }

    #[tracing::instrument(skip(self, completed), fields(sync_id = %completed.sync_id))]
    async fn record_completed_sync(
        &self,
        completed: &CompletedSync,
    ) -> anyhow::Result<SyncCounter> {
        let requested_root = completed.root_path.to_string_lossy().to_string();
        let mut tx = self.pool.begin().await?;

        // First write takes the database write lock for the whole commit
        sqlx::query("UPDATE sync_state SET sync_counter = sync_counter + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query("SELECT sync_counter, root_path FROM sync_state WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?;
        let counter = SyncCounter::new(to_u64(row.get("sync_counter")));
        let stored_root: Option<String> = row.get("root_path");

        if let Some(stored) = stored_root {
            if stored != requested_root {
                return Err(CacheError::RootMismatch {
                    stored,
                    requested: requested_root,
                }
                .into());
            }
        }

        for entry in &completed.entries {
            upsert_entry(&mut tx, entry, counter).await?;
        }

        for report in &completed.conflicts {
            let json = serde_json::to_string(report).map_err(|e| {
                CacheError::SerializationError(format!("Failed to serialize conflict: {}", e))
            })?;
            sqlx::query(
                "INSERT INTO conflicts (sync_counter, path, winner, report) VALUES (?, ?, ?, ?)",
            )
            .bind(to_i64(counter.value()))
            .bind(report.path.as_str())
            .bind(report.winner.as_str())
            .bind(&json)
            .execute(&mut *tx)
            .await?;
        }

        for id in &completed.applied_change_ids {
            retire_change(&mut tx, *id, "applied", counter).await?;
        }
        for id in &completed.discarded_change_ids {
            retire_change(&mut tx, *id, "discarded", counter).await?;
        }

        sqlx::query(
            "UPDATE sync_state SET root_path = ?, \
                remote_cursor = COALESCE(?, remote_cursor), \
                last_sync_id = ?, last_completed_at = ? \
             WHERE id = 1",
        )
        .bind(&requested_root)
        .bind(completed.remote_cursor.as_deref())
        .bind(completed.sync_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            counter = %counter,
            entries = completed.entries.len(),
            applied = completed.applied_change_ids.len(),
            discarded = completed.discarded_change_ids.len(),
            conflicts = completed.conflicts.len(),
            "Recorded completed sync"
        );
        Ok(counter)
    }

    async fn conflicts(&self) -> anyhow::Result<Vec<ConflictReport>> {
        let rows = sqlx::query("SELECT report FROM conflicts ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let reports = rows
            .iter()
            .map(conflict_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reports)
    }

    #[tracing::instrument(skip(self))]
    async fn wipe_index(&self, root_path: &Path) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM index_entries")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM change_log").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM conflicts").execute(&mut *tx).await?;
        sqlx::query(
            "UPDATE sync_state SET sync_counter = 0, remote_cursor = NULL, root_path = ?, \
                last_sync_id = NULL, last_completed_at = NULL \
             WHERE id = 1",
        )
        .bind(root_path.to_string_lossy().to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(root = %root_path.display(), "Local Index wiped");
        Ok(())
    }
}
