//! Remote store port
//!
//! The operations the Sync Engine and Transfer Scheduler need from the
//! server. Errors are already classified as [`TransferError`] so the
//! scheduler can decide whether to retry.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::domain::{
    ContentHash, RelativePath, RemoteChangeSet, RemoteItem, ServerUid, TransferError,
};

/// Progress sink handed to transfer operations
///
/// Invoked with `(bytes_transferred, total_bytes)`. A panicking callback is
/// caught and ignored; it never aborts the transfer.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(u64, u64) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    /// Forward progress to the sink, swallowing panics
    pub fn report(&self, transferred: u64, total: u64) {
        let sink = &self.sink;
        if std::panic::catch_unwind(AssertUnwindSafe(|| sink(transferred, total))).is_err() {
            tracing::debug!(transferred, total, "Progress callback panicked, ignoring");
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

/// Upload of a local file (or creation of a folder) at `path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub path: RelativePath,
    /// Absolute local path to read from
    pub source: PathBuf,
    pub size: u64,
    pub content_hash: Option<ContentHash>,
    pub is_folder: bool,
    /// Server identity being overwritten, if the item exists remotely
    pub server_uid: Option<ServerUid>,
    /// Revision the local edit was based on
    pub base_revision: Option<u64>,
}

/// Download of a remote file into `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub path: RelativePath,
    pub server_uid: ServerUid,
    /// Absolute local destination
    pub target: PathBuf,
    pub size: u64,
    pub revision: u64,
    pub content_hash: Option<ContentHash>,
}

/// Port trait for server-side operations on the synchronized tree
#[async_trait::async_trait]
pub trait IRemoteStore: Send + Sync {
    /// Changes since `cursor` (`None` for a full listing)
    async fn fetch_changes(&self, cursor: Option<&str>) -> Result<RemoteChangeSet, TransferError>;

    /// Upload file content; returns the server's view of the new item
    async fn upload(
        &self,
        request: &UploadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RemoteItem, TransferError>;

    /// Download file content to `request.target`
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError>;

    async fn create_folder(&self, path: &RelativePath) -> Result<RemoteItem, TransferError>;

    async fn delete(
        &self,
        path: &RelativePath,
        server_uid: Option<&ServerUid>,
    ) -> Result<(), TransferError>;

    async fn rename(
        &self,
        from: &RelativePath,
        to: &RelativePath,
        server_uid: Option<&ServerUid>,
    ) -> Result<RemoteItem, TransferError>;
}
