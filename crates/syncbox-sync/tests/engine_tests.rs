//! Integration tests for SyncEngine
//!
//! Each test runs the engine against a real SQLite index (in memory), a
//! temporary sync root and an in-process remote store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use syncbox_cache::{DatabasePool, SqliteLocalIndex};
use syncbox_core::domain::{
    ChangeId, ChangeKind, ChangeRecord, ConflictReport, ConflictSide, DiffResult, Direction,
    IndexEntry, RelativePath, RemoteChange, RemoteChangeSet, RemoteItem, ReservationOwner,
    ServerUid, SyncCounter, SyncError, SyncboxId, TransferError,
};
use syncbox_core::ports::{
    CompletedSync, DownloadRequest, ILocalIndex, IRemoteStore, ProgressReporter, UploadRequest,
};
use syncbox_sync::backoff::Backoff;
use syncbox_sync::engine::{EngineState, StartStatus, StopStatus};
use syncbox_sync::filesystem::LocalTree;
use syncbox_sync::{
    EngineEvent, FileSystemMonitor, SyncEngine, SyncboxContext, TransferConfig,
    TransferScheduler,
};

// ============================================================================
// In-process remote store
// ============================================================================

#[derive(Default)]
struct MemoryRemote {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    folders: Mutex<Vec<String>>,
    queued: Mutex<Vec<RemoteChange>>,
    fetches: AtomicUsize,
    revision: AtomicU64,
    reject_uploads: AtomicBool,
    /// Uploads block until their transfer is cancelled
    hold_uploads: AtomicBool,
    upload_started: tokio::sync::Notify,
    transient_deletes: AtomicBool,
}

impl MemoryRemote {
    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn item(&self, path: &RelativePath, size: u64, is_folder: bool) -> RemoteItem {
        RemoteItem {
            path: path.clone(),
            server_uid: uid(path.as_str()),
            parent_uid: None,
            revision: self.next_revision(),
            content_hash: None,
            size,
            is_folder,
        }
    }

    /// Place content on the server and report it in the next listing
    fn publish(&self, path: &str, content: &[u8], revision: u64, modified: chrono::DateTime<Utc>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        self.queued.lock().unwrap().push(RemoteChange {
            path: rel(path),
            previous_path: None,
            server_uid: uid(path),
            parent_uid: None,
            revision,
            content_hash: None,
            size: content.len() as u64,
            modified_time: modified,
            is_folder: false,
            is_deleted: false,
        });
    }

    fn queue(&self, change: RemoteChange) {
        self.queued.lock().unwrap().push(change);
    }

    fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait::async_trait]
impl IRemoteStore for MemoryRemote {
    async fn fetch_changes(&self, _cursor: Option<&str>) -> Result<RemoteChangeSet, TransferError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RemoteChangeSet {
            changes: std::mem::take(&mut *self.queued.lock().unwrap()),
            next_cursor: Some(format!("cursor-{n}")),
        })
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RemoteItem, TransferError> {
        if self.reject_uploads.load(Ordering::SeqCst) {
            return Err(TransferError::Permanent("HTTP 403: quota exceeded".into()));
        }
        if self.hold_uploads.load(Ordering::SeqCst) {
            self.upload_started.notify_one();
            cancel.cancelled().await;
            return Err(TransferError::Transient("connection reset".into()));
        }
        let bytes = tokio::fs::read(&request.source)
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;
        progress.report(bytes.len() as u64, request.size);
        let size = bytes.len() as u64;
        self.files
            .lock()
            .unwrap()
            .insert(request.path.to_string(), bytes);
        Ok(self.item(&request.path, size, false))
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        _progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let bytes = self
            .content(request.path.as_str())
            .ok_or_else(|| TransferError::Permanent(format!("HTTP 404: {}", request.path)))?;
        if let Some(parent) = request.target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::Transient(e.to_string()))?;
        }
        tokio::fs::write(&request.target, bytes)
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))
    }

    async fn create_folder(&self, path: &RelativePath) -> Result<RemoteItem, TransferError> {
        self.folders.lock().unwrap().push(path.to_string());
        Ok(self.item(path, 0, true))
    }

    async fn delete(&self, path: &RelativePath, _uid: Option<&ServerUid>) -> Result<(), TransferError> {
        if self.transient_deletes.load(Ordering::SeqCst) {
            return Err(TransferError::Transient("HTTP 503".into()));
        }
        self.files.lock().unwrap().remove(path.as_str());
        Ok(())
    }

    async fn rename(
        &self,
        from: &RelativePath,
        to: &RelativePath,
        _uid: Option<&ServerUid>,
    ) -> Result<RemoteItem, TransferError> {
        let bytes = self.files.lock().unwrap().remove(from.as_str());
        let size = bytes.as_ref().map_or(0, |b| b.len() as u64);
        if let Some(bytes) = bytes {
            self.files.lock().unwrap().insert(to.to_string(), bytes);
        }
        Ok(self.item(to, size, false))
    }
}

// ============================================================================
// Local index with injectable commit failures
// ============================================================================

struct FaultyIndex {
    inner: SqliteLocalIndex,
    fail_commits: AtomicBool,
}

#[async_trait::async_trait]
impl ILocalIndex for FaultyIndex {
    async fn sync_counter(&self) -> anyhow::Result<SyncCounter> {
        self.inner.sync_counter().await
    }

    async fn remote_cursor(&self) -> anyhow::Result<Option<String>> {
        self.inner.remote_cursor().await
    }

    async fn root_path(&self) -> anyhow::Result<Option<PathBuf>> {
        self.inner.root_path().await
    }

    async fn get_entry(&self, path: &RelativePath) -> anyhow::Result<Option<IndexEntry>> {
        self.inner.get_entry(path).await
    }

    async fn entries(&self) -> anyhow::Result<Vec<IndexEntry>> {
        self.inner.entries().await
    }

    async fn entries_under(&self, prefix: &RelativePath) -> anyhow::Result<Vec<IndexEntry>> {
        self.inner.entries_under(prefix).await
    }

    async fn append_change(&self, change: &ChangeRecord) -> anyhow::Result<()> {
        self.inner.append_change(change).await
    }

    async fn pending_changes(&self) -> anyhow::Result<Vec<ChangeRecord>> {
        self.inner.pending_changes().await
    }

    async fn max_change_id(&self) -> anyhow::Result<Option<ChangeId>> {
        self.inner.max_change_id().await
    }

    async fn diff(
        &self,
        remote: &[RemoteChange],
        local: &[ChangeRecord],
    ) -> anyhow::Result<DiffResult> {
        self.inner.diff(remote, local).await
    }

    async fn record_completed_sync(
        &self,
        completed: &CompletedSync,
    ) -> anyhow::Result<SyncCounter> {
        if self.fail_commits.load(Ordering::SeqCst) {
            anyhow::bail!("disk I/O error");
        }
        self.inner.record_completed_sync(completed).await
    }

    async fn conflicts(&self) -> anyhow::Result<Vec<ConflictReport>> {
        self.inner.conflicts().await
    }

    async fn wipe_index(&self, root_path: &Path) -> anyhow::Result<()> {
        self.inner.wipe_index(root_path).await
    }
}

// ============================================================================
// Test helpers
// ============================================================================

fn rel(path: &str) -> RelativePath {
    RelativePath::new(path).unwrap()
}

fn uid(path: &str) -> ServerUid {
    ServerUid::new(format!("uid-{}", path.replace('/', "-"))).unwrap()
}

struct Harness {
    _dir: TempDir,
    engine: SyncEngine,
    context: Arc<SyncboxContext>,
    index: Arc<FaultyIndex>,
    remote: Arc<MemoryRemote>,
}

impl Harness {
    fn root(&self) -> &Path {
        self.engine.tree().root()
    }

    fn write(&self, path: &str, content: &str) {
        let full = self.root().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    /// Queue a local record straight into the change log
    async fn enqueue(&self, kind: ChangeKind, path: &str) -> ChangeRecord {
        let record = ChangeRecord::builder(kind, Direction::LocalToRemote, rel(path))
            .modified_time(Utc::now())
            .build(&self.engine.ids())
            .unwrap();
        self.index.append_change(&record).await.unwrap();
        record
    }

    async fn is_pending(&self, record: &ChangeRecord) -> bool {
        self.index
            .pending_changes()
            .await
            .unwrap()
            .iter()
            .any(|r| r.id() == record.id())
    }
}

/// Uploaded count of the next `PassCompleted` that uploaded something
async fn next_upload(events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> u32 {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::PassCompleted(report)) = events.recv().await {
                if report.uploaded > 0 {
                    return report.uploaded;
                }
            }
        }
    })
    .await
    .expect("change was not synchronized")
}

async fn setup() -> Harness {
    let dir = TempDir::new().unwrap();
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    let index = Arc::new(FaultyIndex {
        inner: pool.index(),
        fail_commits: AtomicBool::new(false),
    });
    let remote = Arc::new(MemoryRemote::default());

    let context = Arc::new(SyncboxContext::new(SyncboxId::new(1)));
    let config = TransferConfig {
        max_concurrent_uploads: 2,
        max_concurrent_downloads: 2,
        max_attempts: 2,
        backoff: Backoff::none(),
    };
    context
        .configure_scheduler(Arc::new(TransferScheduler::new(remote.clone(), config, None)))
        .unwrap();

    let engine = SyncEngine::builder(
        Arc::clone(&context),
        index.clone(),
        remote.clone(),
        LocalTree::new(dir.path()),
    )
    .build()
    .unwrap();

    Harness {
        _dir: dir,
        engine,
        context,
        index,
        remote,
    }
}

// ============================================================================
// Passes
// ============================================================================

#[tokio::test]
async fn test_first_pass_indexes_and_uploads_existing_tree() {
    let h = setup().await;
    h.write("a.txt", "alpha");
    h.write("docs/b.txt", "bravo");

    let report = h.engine.run_pass().await.unwrap();

    assert_eq!(report.counter, SyncCounter::new(1));
    assert_eq!(report.uploaded, 2);
    assert_eq!(report.folders_created, 1);
    assert!(report.is_clean());
    assert_eq!(h.remote.content("docs/b.txt").unwrap(), b"bravo");
    assert_eq!(h.remote.folders.lock().unwrap().as_slice(), ["docs"]);

    let live: Vec<String> = h
        .index
        .entries()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.is_live())
        .map(|e| e.path.to_string())
        .collect();
    assert_eq!(live.len(), 3);
    assert!(live.contains(&"docs/b.txt".to_string()));

    assert!(h.engine.pending_changes().await.is_empty());
    assert_eq!(
        h.index.remote_cursor().await.unwrap().as_deref(),
        Some("cursor-1")
    );
}

#[tokio::test]
async fn test_remote_create_is_downloaded() {
    let h = setup().await;
    h.engine.run_pass().await.unwrap();

    h.remote.publish("inbox/report.pdf", b"%PDF-1.7", 5, Utc::now());
    let report = h.engine.run_pass().await.unwrap();

    assert_eq!(report.downloaded, 1);
    assert_eq!(report.counter, SyncCounter::new(2));
    let local = std::fs::read(h.root().join("inbox/report.pdf")).unwrap();
    assert_eq!(local, b"%PDF-1.7");

    let entry = h.index.get_entry(&rel("inbox/report.pdf")).await.unwrap().unwrap();
    assert_eq!(entry.revision, 5);
    assert_eq!(entry.server_uid, Some(uid("inbox/report.pdf")));
}

#[tokio::test]
async fn test_counter_advances_once_per_pass() {
    let h = setup().await;

    for expected in 1..=3 {
        let report = h.engine.run_pass().await.unwrap();
        assert_eq!(report.counter, SyncCounter::new(expected));
    }
    assert_eq!(h.index.sync_counter().await.unwrap(), SyncCounter::new(3));
}

#[tokio::test]
async fn test_conflict_tie_goes_to_server() {
    let h = setup().await;
    h.engine.run_pass().await.unwrap();

    let modified = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    h.write("shared.txt", "local edit");
    let local = ChangeRecord::builder(ChangeKind::Modify, Direction::LocalToRemote, rel("shared.txt"))
        .content_hash(syncbox_core::domain::ContentHash::new("aa").unwrap())
        .size(10)
        .modified_time(modified)
        .server_revision(3)
        .build(&h.engine.ids())
        .unwrap();
    h.engine.change_sender().send(local.clone()).await.unwrap();
    h.remote.publish("shared.txt", b"server edit", 3, modified);

    let report = h.engine.run_pass().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.winner, ConflictSide::Remote);
    assert_eq!(conflict.local_change_id, local.id());
    assert!(conflict.reason().contains("tie"));

    // loser discarded, server content in place
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.downloaded, 1);
    assert_eq!(
        std::fs::read_to_string(h.root().join("shared.txt")).unwrap(),
        "server edit"
    );
    assert!(h.engine.pending_changes().await.is_empty());
    assert_eq!(h.index.conflicts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_permanent_upload_failure_is_reported_and_discarded() {
    let h = setup().await;
    h.remote.reject_uploads.store(true, Ordering::SeqCst);
    h.write("big.iso", "payload");

    let report = h.engine.run_pass().await.unwrap();

    assert_eq!(report.uploaded, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(
        report.errors.causes()[0],
        SyncError::Transfer(TransferError::Permanent(_))
    ));
    assert_eq!(report.counter, SyncCounter::new(1));
    assert!(h.engine.pending_changes().await.is_empty());
}

#[tokio::test]
async fn test_queued_records_survive_in_the_change_log() {
    let h = setup().await;
    h.engine.run_pass().await.unwrap();

    h.write("notes.md", "draft");
    let record = ChangeRecord::builder(ChangeKind::Create, Direction::LocalToRemote, rel("notes.md"))
        .size(5)
        .modified_time(Utc::now())
        .build(&h.engine.ids())
        .unwrap();
    h.index.append_change(&record).await.unwrap();

    // picked up from the index, not the inbox
    let report = h.engine.run_pass().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert!(h.index.pending_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_downloaded_file_is_not_uploaded_back() {
    let h = setup().await;
    h.engine.run_pass().await.unwrap();
    h.remote.publish("photo.jpg", b"\xff\xd8\xff\xe0 jpeg", 7, Utc::now());
    assert_eq!(h.engine.run_pass().await.unwrap().downloaded, 1);
    let revisions_issued = h.remote.revision.load(Ordering::SeqCst);

    // what the monitor reports after the download wrote the file
    let echo = ChangeRecord::builder(ChangeKind::Create, Direction::LocalToRemote, rel("photo.jpg"))
        .content_hash(h.engine.tree().hash(&rel("photo.jpg")).await.unwrap())
        .size(9)
        .modified_time(Utc::now())
        .build(&h.engine.ids())
        .unwrap();
    h.engine.change_sender().send(echo).await.unwrap();

    let report = h.engine.run_pass().await.unwrap();
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.retired, 1);
    assert_eq!(h.remote.revision.load(Ordering::SeqCst), revisions_issued);
    let entry = h.index.get_entry(&rel("photo.jpg")).await.unwrap().unwrap();
    assert_eq!(entry.revision, 7);
    assert!(h.engine.pending_changes().await.is_empty());
}

#[tokio::test]
async fn test_remote_delete_removes_local_file() {
    let h = setup().await;
    h.write("old.log", "stale");
    h.engine.run_pass().await.unwrap();

    h.remote.queue(RemoteChange {
        path: rel("old.log"),
        previous_path: None,
        server_uid: uid("old.log"),
        parent_uid: None,
        revision: 10,
        content_hash: None,
        size: 0,
        modified_time: Utc::now(),
        is_folder: false,
        is_deleted: true,
    });
    let report = h.engine.run_pass().await.unwrap();

    assert_eq!(report.deleted_local, 1);
    assert!(!h.root().join("old.log").exists());
    let entry = h.index.get_entry(&rel("old.log")).await.unwrap().unwrap();
    assert!(!entry.is_live());
    assert_eq!(entry.revision, 10);
}

#[tokio::test]
async fn test_remote_folder_rename_moves_children() {
    let h = setup().await;
    h.write("docs/b.txt", "bravo");
    h.engine.run_pass().await.unwrap();

    h.remote.queue(RemoteChange {
        path: rel("archive"),
        previous_path: Some(rel("docs")),
        server_uid: uid("docs"),
        parent_uid: None,
        revision: 100,
        content_hash: None,
        size: 0,
        modified_time: Utc::now(),
        is_folder: true,
        is_deleted: false,
    });
    let report = h.engine.run_pass().await.unwrap();

    assert_eq!(report.renamed_local, 1);
    assert_eq!(report.downloaded, 0);
    assert_eq!(
        std::fs::read_to_string(h.root().join("archive/b.txt")).unwrap(),
        "bravo"
    );
    assert!(!h.root().join("docs").exists());

    let moved = h.index.get_entry(&rel("archive/b.txt")).await.unwrap().unwrap();
    assert!(moved.is_live());
    assert_eq!(moved.server_uid, Some(uid("docs/b.txt")));
    assert!(!h.index.get_entry(&rel("docs/b.txt")).await.unwrap().unwrap().is_live());

    let folder = h.index.get_entry(&rel("archive")).await.unwrap().unwrap();
    assert!(folder.is_live() && folder.is_folder);
    assert_eq!(folder.revision, 100);
    let old = h.index.get_entry(&rel("docs")).await.unwrap().unwrap();
    assert!(!old.is_live());
    assert_eq!(old.revision, 100);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_transient_delete_failure_keeps_record_queued() {
    let h = setup().await;
    h.write("a.txt", "alpha");
    h.engine.run_pass().await.unwrap();

    std::fs::remove_file(h.root().join("a.txt")).unwrap();
    let delete = h.enqueue(ChangeKind::Delete, "a.txt").await;
    h.remote.transient_deletes.store(true, Ordering::SeqCst);

    let report = h.engine.run_pass().await.unwrap();
    assert_eq!(report.deleted_remote, 0);
    assert!(matches!(
        report.errors.causes()[0],
        SyncError::Transfer(TransferError::Transient(_))
    ));
    assert!(h.is_pending(&delete).await);
    assert!(h.remote.content("a.txt").is_some());
    assert!(h.index.get_entry(&rel("a.txt")).await.unwrap().unwrap().is_live());

    h.remote.transient_deletes.store(false, Ordering::SeqCst);
    let report = h.engine.run_pass().await.unwrap();
    assert_eq!(report.deleted_remote, 1);
    assert!(!h.is_pending(&delete).await);
    assert!(h.remote.content("a.txt").is_none());
    assert!(!h.index.get_entry(&rel("a.txt")).await.unwrap().unwrap().is_live());
}

#[tokio::test]
async fn test_failed_commit_leaves_counter_and_queue_untouched() {
    let h = setup().await;
    h.engine.run_pass().await.unwrap();

    h.write("notes.md", "draft");
    let record = h.enqueue(ChangeKind::Create, "notes.md").await;
    h.index.fail_commits.store(true, Ordering::SeqCst);
    let mut events = h.engine.subscribe();

    let result = h.engine.run_pass().await;
    assert!(matches!(result, Err(SyncError::Storage(_))), "{result:?}");

    let mut states = Vec::new();
    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::StateChanged(state) => states.push(state),
            EngineEvent::PassFailed(_) => failed = true,
            _ => {}
        }
    }
    assert!(failed);
    assert_eq!(states[states.len() - 2..], [EngineState::Error, EngineState::Idle]);
    assert_eq!(h.engine.state(), EngineState::Idle);

    assert_eq!(h.index.sync_counter().await.unwrap(), SyncCounter::new(1));
    assert!(h.index.get_entry(&rel("notes.md")).await.unwrap().is_none());
    assert!(h.is_pending(&record).await);

    h.index.fail_commits.store(false, Ordering::SeqCst);
    let report = h.engine.run_pass().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.counter, SyncCounter::new(2));
    assert!(!h.is_pending(&record).await);
}

// ============================================================================
// Lifecycle and reservation
// ============================================================================

#[tokio::test]
async fn test_start_refused_while_reserved() {
    let h = setup().await;
    h.context
        .try_reserve(ReservationOwner::Administrative("restore".into()))
        .unwrap();

    assert_eq!(h.engine.start().await.unwrap(), StartStatus::Reserved);
    assert!(!h.engine.is_running().await);
    assert!(matches!(
        h.engine.run_pass().await,
        Err(SyncError::Reservation { .. })
    ));
}

#[tokio::test]
async fn test_start_stop_lifecycle() {
    let h = setup().await;
    let mut states = h.engine.watch_state();
    assert_eq!(h.engine.state(), EngineState::Stopped);

    assert_eq!(h.engine.start().await.unwrap(), StartStatus::Started);
    assert_eq!(h.engine.start().await.unwrap(), StartStatus::AlreadyRunning);
    assert!(h.context.reservation().is_reserved());

    // first pass runs right away
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.index.sync_counter().await.unwrap() == SyncCounter::ZERO {
            let _ = states.changed().await;
        }
    })
    .await
    .expect("first pass did not commit");

    assert_eq!(h.engine.stop().await, StopStatus::Stopped);
    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert!(!h.context.reservation().is_reserved());
    assert_eq!(h.engine.stop().await, StopStatus::NotRunning);
}

#[tokio::test]
async fn test_stop_during_upload_keeps_last_commit() {
    let h = setup().await;
    h.write("a.txt", "alpha");
    h.engine.run_pass().await.unwrap();

    h.write("b.txt", "bravo");
    let record = h.enqueue(ChangeKind::Create, "b.txt").await;
    h.remote.hold_uploads.store(true, Ordering::SeqCst);

    h.engine.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), h.remote.upload_started.notified())
        .await
        .expect("upload never started");
    assert_eq!(h.engine.stop().await, StopStatus::Stopped);

    assert_eq!(h.index.sync_counter().await.unwrap(), SyncCounter::new(1));
    assert!(h.index.get_entry(&rel("b.txt")).await.unwrap().is_none());
    assert!(h.index.get_entry(&rel("a.txt")).await.unwrap().unwrap().is_live());
    assert!(h.is_pending(&record).await);
    assert!(h.remote.content("b.txt").is_none());

    h.remote.hold_uploads.store(false, Ordering::SeqCst);
    let report = h.engine.run_pass().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.counter, SyncCounter::new(2));
}

#[tokio::test]
async fn test_monitor_resumes_after_restart() {
    let h = setup().await;
    let monitor = FileSystemMonitor::start(
        h.engine.tree().clone(),
        h.engine.ids(),
        Duration::from_millis(50),
        h.engine.change_sender(),
    )
    .unwrap();
    h.engine.attach_monitor(monitor).await;
    let mut events = h.engine.subscribe();

    assert_eq!(h.engine.start().await.unwrap(), StartStatus::Started);
    assert_eq!(h.engine.stop().await, StopStatus::Stopped);
    assert_eq!(h.engine.start().await.unwrap(), StartStatus::Started);

    h.write("after-restart.txt", "watched");
    assert_eq!(next_upload(&mut events).await, 1);
    assert_eq!(h.remote.content("after-restart.txt").unwrap(), b"watched");
    h.engine.stop().await;
}

#[tokio::test]
async fn test_stop_quiesces_monitor_when_start_was_refused() {
    let h = setup().await;
    let monitor = FileSystemMonitor::start(
        h.engine.tree().clone(),
        h.engine.ids(),
        Duration::from_millis(50),
        h.engine.change_sender(),
    )
    .unwrap();
    let processor = monitor.processor();
    h.engine.attach_monitor(monitor).await;
    h.context
        .try_reserve(ReservationOwner::Administrative("restore".into()))
        .unwrap();

    assert_eq!(h.engine.start().await.unwrap(), StartStatus::Reserved);
    assert_eq!(h.engine.stop().await, StopStatus::NotRunning);
    assert!(processor.is_terminated());
}

#[tokio::test]
async fn test_running_engine_picks_up_local_changes() {
    let h = setup().await;
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();

    h.write("live.txt", "hello");
    let record = ChangeRecord::builder(ChangeKind::Create, Direction::LocalToRemote, rel("live.txt"))
        .size(5)
        .modified_time(Utc::now())
        .build(&h.engine.ids())
        .unwrap();
    h.engine.change_sender().send(record).await.unwrap();

    assert_eq!(next_upload(&mut events).await, 1);
    assert_eq!(h.remote.content("live.txt").unwrap(), b"hello");
    h.engine.stop().await;
}

#[tokio::test]
async fn test_wipe_index_requires_stopped_engine() {
    let h = setup().await;
    h.write("a.txt", "alpha");
    h.engine.start().await.unwrap();

    assert!(matches!(
        h.engine.wipe_index().await,
        Err(SyncError::Validation(_))
    ));

    h.engine.stop().await;
    h.engine.run_pass().await.unwrap();
    assert!(h.index.sync_counter().await.unwrap() > SyncCounter::ZERO);

    h.engine.wipe_index().await.unwrap();
    assert_eq!(h.index.sync_counter().await.unwrap(), SyncCounter::ZERO);
    assert!(h.index.entries().await.unwrap().is_empty());
    assert!(!h.context.reservation().is_reserved());
}

#[tokio::test]
async fn test_build_requires_scheduler() {
    let dir = TempDir::new().unwrap();
    let pool = DatabasePool::in_memory().await.unwrap();
    let context = Arc::new(SyncboxContext::new(SyncboxId::new(2)));

    let result = SyncEngine::builder(
        context,
        Arc::new(pool.index()),
        Arc::new(MemoryRemote::default()),
        LocalTree::new(dir.path()),
    )
    .build();

    assert!(matches!(result, Err(SyncError::Validation(_))));
}
