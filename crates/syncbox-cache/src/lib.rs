//! Syncbox Cache - durable Local Index
//!
//! SQLite-based storage for:
//! - Index entries (the last synchronized state of every path)
//! - The change log of queued local and remote change records
//! - The sync counter and remote cursor watermark
//! - Conflict reports
//!
//! ## Architecture
//!
//! This crate implements the `ILocalIndex` port from `syncbox-core` using
//! SQLite as the storage backend. Every pass is committed in a single
//! transaction, so a crash leaves the index at the previous counter.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use syncbox_cache::{DatabasePool, SqliteLocalIndex};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let db = DatabasePool::new(Path::new("/home/user/.local/share/syncbox/index.db")).await?;
//! let index: SqliteLocalIndex = db.index();
//! // Use index as ILocalIndex...
//! # Ok(())
//! # }
//! ```

pub mod index;
pub mod pool;

pub use index::SqliteLocalIndex;
pub use pool::{DatabasePool, SCHEMA_VERSION};

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// The database file failed its integrity check
    #[error("Index database is corrupted: {0}")]
    Corrupted(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The index belongs to a different sync root
    #[error("Index is bound to {stored}, refusing to commit for {requested}")]
    RootMismatch { stored: String, requested: String },

    /// A commit referenced a change record that is not pending
    #[error("Change {0} is not pending in the change log")]
    UnknownChange(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
