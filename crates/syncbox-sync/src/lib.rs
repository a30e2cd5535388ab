//! syncbox Sync - Change processing, transfers and the sync engine
//!
//! Provides:
//! - Debounced, coalesced local change capture
//! - Bounded upload/download pools with retry and cancellation
//! - The reconciliation state machine driving each sync pass
//!
//! ## Modules
//!
//! - [`debounce`] - Delay/dedup processor feeding the engine
//! - [`watcher`] - File system monitor (notify backed)
//! - [`transfer`] - Transfer scheduler with per-direction pools
//! - [`engine`] - Sync engine state machine
//! - [`context`] - Per-syncbox shared state (reservation, scheduler)
//! - [`filesystem`] - Local tree operations (walk, hash, apply)

pub mod backoff;
pub mod context;
pub mod debounce;
pub mod engine;
pub mod filesystem;
pub mod metrics;
pub mod transfer;
pub mod watcher;

use std::path::PathBuf;

use syncbox_core::domain::{DomainError, SyncError, TransferError};
use thiserror::Error;

pub use context::SyncboxContext;
pub use debounce::DelayProcessor;
pub use engine::{EngineEvent, EngineState, SyncEngine, SyncReport, SyncTrigger};
pub use transfer::{TransferConfig, TransferOutcome, TransferScheduler};
pub use watcher::FileSystemMonitor;

/// Errors from operations on the local synchronized tree
#[derive(Debug, Error)]
pub enum FsError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A file is currently locked by another process
    #[error("File locked: {0}")]
    FileLocked(PathBuf),

    /// No available disk space to complete the operation
    #[error("Disk full")]
    DiskFull,

    /// Insufficient filesystem permissions
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// The specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// A domain-level error propagated from syncbox-core
    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),
}

impl FsError {
    /// Classify an `io::Error` raised while touching `path`
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        // ENOSPC
        if err.raw_os_error() == Some(28) {
            return Self::DiskFull;
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::PathNotFound(path.into()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.into()),
            std::io::ErrorKind::WouldBlock => Self::FileLocked(path.into()),
            _ => Self::IoError(err),
        }
    }

    /// True if applying the change again later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IoError(_) | Self::FileLocked(_) | Self::DiskFull)
    }
}

/// Local apply failures surface as transfer failures of the change they serve
impl From<FsError> for SyncError {
    fn from(err: FsError) -> Self {
        let reason = err.to_string();
        if err.is_transient() {
            SyncError::Transfer(TransferError::Transient(reason))
        } else {
            SyncError::Transfer(TransferError::Permanent(reason))
        }
    }
}
