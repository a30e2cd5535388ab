//! Opening the Local Index database
//!
//! [`DatabasePool`] owns the SQLite pool behind a [`SqliteLocalIndex`].
//! Opening a file runs `PRAGMA quick_check` so a damaged index is reported
//! before any pass reads it, refuses a schema stamped by a newer release
//! (`PRAGMA user_version`), and applies the embedded schema.
//!
//! File databases use WAL with `synchronous = FULL`: a committed pass must
//! survive power loss. In-memory databases live on a single connection,
//! since SQLite gives every connection its own empty memory database.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::{CacheError, SqliteLocalIndex};

/// Schema version stamped into `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = include_str!("migrations/20260301_local_index.sql");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One writer at a time anyway; a few readers for status queries
const FILE_CONNECTIONS: u32 = 4;

/// SQLite pool holding one Local Index
pub struct DatabasePool {
    pool: SqlitePool,
    /// `None` for in-memory databases
    location: Option<PathBuf>,
}

impl DatabasePool {
    /// Open (or create) the index database at `db_path`
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` if the file cannot be opened, `Corrupted` if the
    /// integrity check fails, `MigrationFailed` for a newer or unappliable
    /// schema.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!("{}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("{}: {e}", db_path.display())))?;

        let db = Self {
            pool,
            location: Some(db_path.to_path_buf()),
        };
        db.quick_check().await?;
        db.apply_schema().await?;
        info!(path = %db_path.display(), "Local index database opened");
        Ok(db)
    }

    /// Fresh in-memory index database, for tests and dry runs
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` or `MigrationFailed`
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory database: {e}")))?;

        let db = Self {
            pool,
            location: None,
        };
        db.apply_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database file, `None` when in memory
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// A Local Index over this pool
    pub fn index(&self) -> SqliteLocalIndex {
        SqliteLocalIndex::new(self.pool.clone())
    }

    /// Closes every connection, checkpointing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn quick_check(&self) -> Result<(), CacheError> {
        let verdict: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        if verdict != "ok" {
            return Err(CacheError::Corrupted(verdict));
        }
        Ok(())
    }

    /// Every schema statement is idempotent; reopening keeps the contents
    async fn apply_schema(&self) -> Result<(), CacheError> {
        let found: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        if found > SCHEMA_VERSION {
            return Err(CacheError::MigrationFailed(format!(
                "index schema version {found} is newer than supported version {SCHEMA_VERSION}"
            )));
        }

        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(e.to_string()))?;
        if found < SCHEMA_VERSION {
            let stamp = format!("PRAGMA user_version = {SCHEMA_VERSION}");
            sqlx::raw_sql(&stamp).execute(&self.pool).await?;
        }

        debug!(from = found, to = SCHEMA_VERSION, "Local index schema ready");
        Ok(())
    }
}
