//! Sync Engine
//!
//! The [`SyncEngine`] reconciles queued local change records with remote
//! changes and commits each pass to the Local Index.
//!
//! ## Pass Flow
//!
//! ```text
//!  Idle ─→ Indexing ─→ Diffing ─→ Executing ─→ Committing ─→ Idle
//!            (first      (fetch +    (direct ops +   (one index
//!             pass only)  diff)       transfers)      transaction)
//!
//!  any working state ─→ Error ─→ Idle          stop() ─→ Stopped
//! ```
//!
//! 1. **Indexing**: only when the index is empty; walks the sync root and
//!    queues a `Create` record per item
//! 2. **Diffing**: fetches remote changes since the stored cursor and asks
//!    the index for the diff against the queued records
//! 3. **Executing**: applies renames, deletes and folder creation directly,
//!    hands file content to the [`TransferScheduler`] and awaits every handle
//! 4. **Committing**: `record_completed_sync` with applied and discarded
//!    record ids, new entries, conflicts and the next cursor
//!
//! ## Failure Handling
//!
//! - A cancelled transfer or a cancelled pass aborts without committing.
//! - A permanent failure of a local change discards the record and is
//!   reported in the pass's [`ErrorList`]; the pass still commits.
//! - A transient failure of a local change leaves the record queued.
//! - Any failure applying a remote change keeps the stored cursor, so the
//!   change is fetched again next pass.
//! - Storage failures move to `Error`, keep the queue and return to `Idle`
//!   without advancing the counter.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use syncbox_core::domain::{
    ChangeId, ChangeIdGenerator, ChangeKind, ChangeRecord, ConflictReport, ConflictSide,
    DiffResult, Direction, ErrorList, IndexEntry, LocalAction, RelativePath, RemoteAction,
    RemoteChange, ReservationOwner, SyncCounter, SyncError, SyncId, TransferError,
};
use syncbox_core::ports::{CompletedSync, DownloadRequest, ILocalIndex, IRemoteStore, UploadRequest};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::context::SyncboxContext;
use crate::filesystem::LocalTree;
use crate::metrics::SyncMetrics;
use crate::transfer::{TransferHandle, TransferOutcome, TransferRequest, TransferScheduler};
use crate::watcher::FileSystemMonitor;
use crate::FsError;

/// Capacity of the change and trigger inboxes
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Public types
// ============================================================================

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Idle,
    Indexing,
    Diffing,
    Executing,
    Committing,
    Error,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Indexing => "indexing",
            Self::Diffing => "diffing",
            Self::Executing => "executing",
            Self::Committing => "committing",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// True while a pass is in progress
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            Self::Indexing | Self::Diffing | Self::Executing | Self::Committing
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    LocalChange,
    RemotePush,
    Ping,
    PollTimer,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    AlreadyRunning,
    /// Another operation holds the syncbox reservation
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Stopped,
    NotRunning,
}

/// Summary of one committed pass
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub sync_id: SyncId,
    /// Counter value committed by this pass
    pub counter: SyncCounter,
    pub uploaded: u32,
    pub downloaded: u32,
    pub folders_created: u32,
    pub deleted_local: u32,
    pub deleted_remote: u32,
    pub renamed_local: u32,
    pub renamed_remote: u32,
    /// Remote changes whose content was already present locally
    pub adopted: u32,
    /// Local records retired without any action
    pub retired: u32,
    pub skipped_remote: u32,
    pub conflicts: Vec<ConflictReport>,
    /// Non-fatal failures of individual changes
    pub errors: ErrorList,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(sync_id: SyncId) -> Self {
        Self {
            sync_id,
            ..Self::default()
        }
    }

    /// True if every change was applied
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Notifications published on the engine's broadcast channel
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(EngineState),
    PassCompleted(SyncReport),
    Conflict(ConflictReport),
    PassFailed(String),
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`SyncEngine`] from its collaborators
pub struct SyncEngineBuilder {
    context: Arc<SyncboxContext>,
    index: Arc<dyn ILocalIndex>,
    remote: Arc<dyn IRemoteStore>,
    tree: LocalTree,
    ids: Option<Arc<ChangeIdGenerator>>,
    metrics: Option<Arc<SyncMetrics>>,
    poll_interval: Option<Duration>,
    channel_capacity: usize,
}

impl SyncEngineBuilder {
    /// Share an id generator with other record producers
    #[must_use]
    pub fn ids(mut self, ids: Arc<ChangeIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run a pass every `interval` while started
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// # Errors
    /// `SyncError::Validation` if the context has no transfer scheduler
    pub fn build(self) -> Result<SyncEngine, SyncError> {
        let scheduler = self.context.scheduler().ok_or_else(|| {
            SyncError::Validation(format!(
                "no transfer scheduler configured for syncbox {}",
                self.context.syncbox_id()
            ))
        })?;

        let (change_tx, change_rx) = mpsc::channel(self.channel_capacity);
        let (trigger_tx, trigger_rx) = mpsc::channel(self.channel_capacity);
        let (state, _) = watch::channel(EngineState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                context: self.context,
                index: self.index,
                remote: self.remote,
                scheduler,
                tree: self.tree,
                ids: self.ids.unwrap_or_default(),
                metrics: self.metrics,
                poll_interval: self.poll_interval,
                state,
                events,
                change_tx,
                trigger_tx,
                inbox: StdMutex::new(Some(Inbox {
                    changes: change_rx,
                    triggers: trigger_rx,
                })),
                pending: Mutex::new(BTreeMap::new()),
                lifecycle: Mutex::new(None),
                pass_lock: Mutex::new(()),
                active_pass: StdMutex::new(None),
                monitor: Mutex::new(None),
            }),
        })
    }
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Reconciliation state machine for one syncbox
///
/// Cheap to clone; clones share the same engine.
///
/// ## Dependencies
///
/// - `context`: reservation and the shared transfer scheduler
/// - `index`: durable last-synchronized state (ILocalIndex)
/// - `remote`: server operations (IRemoteStore)
/// - `tree`: the local sync root
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct Inbox {
    changes: mpsc::Receiver<ChangeRecord>,
    triggers: mpsc::Receiver<SyncTrigger>,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    context: Arc<SyncboxContext>,
    index: Arc<dyn ILocalIndex>,
    remote: Arc<dyn IRemoteStore>,
    scheduler: Arc<TransferScheduler>,
    tree: LocalTree,
    ids: Arc<ChangeIdGenerator>,
    metrics: Option<Arc<SyncMetrics>>,
    poll_interval: Option<Duration>,
    state: watch::Sender<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    change_tx: mpsc::Sender<ChangeRecord>,
    trigger_tx: mpsc::Sender<SyncTrigger>,
    /// Owned by the run loop while started
    inbox: StdMutex<Option<Inbox>>,
    /// Queued local records by id, mirrored in the index change log
    pending: Mutex<BTreeMap<ChangeId, ChangeRecord>>,
    lifecycle: Mutex<Option<RunningLoop>>,
    pass_lock: Mutex<()>,
    active_pass: StdMutex<Option<CancellationToken>>,
    monitor: Mutex<Option<FileSystemMonitor>>,
}

impl SyncEngine {
    pub fn builder(
        context: Arc<SyncboxContext>,
        index: Arc<dyn ILocalIndex>,
        remote: Arc<dyn IRemoteStore>,
        tree: LocalTree,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            context,
            index,
            remote,
            tree,
            ids: None,
            metrics: None,
            poll_interval: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Where the delay processor sends coalesced local records
    pub fn change_sender(&self) -> mpsc::Sender<ChangeRecord> {
        self.inner.change_tx.clone()
    }

    /// Where push notifications, pings and timers request a pass
    pub fn trigger_sender(&self) -> mpsc::Sender<SyncTrigger> {
        self.inner.trigger_tx.clone()
    }

    pub fn ids(&self) -> Arc<ChangeIdGenerator> {
        Arc::clone(&self.inner.ids)
    }

    pub fn tree(&self) -> &LocalTree {
        &self.inner.tree
    }

    /// Queued local records, oldest first
    pub async fn pending_changes(&self) -> Vec<ChangeRecord> {
        self.inner.pending.lock().await.values().cloned().collect()
    }

    /// Hand the monitor to the engine
    ///
    /// `stop()` quiesces it and `start()` restarts it if it was stopped.
    pub async fn attach_monitor(&self, monitor: FileSystemMonitor) {
        *self.inner.monitor.lock().await = Some(monitor);
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.is_some()
    }

    /// Reserve the syncbox, reload queued records and spawn the run loop
    ///
    /// The loop runs a first pass immediately.
    ///
    /// # Errors
    /// Storage errors while reloading queued records; the reservation is
    /// released again in that case
    #[instrument(skip(self), fields(syncbox = %self.inner.context.syncbox_id()))]
    pub async fn start(&self) -> Result<StartStatus, SyncError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Ok(StartStatus::AlreadyRunning);
        }

        match self.inner.context.try_reserve(ReservationOwner::SyncEngine) {
            Ok(()) => {}
            Err(SyncError::Reservation { holder }) => {
                info!(holder = %holder, "Syncbox reserved, not starting");
                return Ok(StartStatus::Reserved);
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.inner.reload_pending().await {
            self.inner.context.reset_reservation();
            return Err(e);
        }

        if let Some(monitor) = self.inner.monitor.lock().await.as_mut() {
            if let Err(e) = monitor.restart() {
                self.inner.context.reset_reservation();
                return Err(SyncError::Validation(format!(
                    "cannot watch sync root {}: {e:#}",
                    self.inner.tree.root().display()
                )));
            }
        }

        let Some(inbox) = self.inner.take_inbox() else {
            self.inner.context.reset_reservation();
            return Err(SyncError::Validation(
                "engine inbox is held by another pass".to_string(),
            ));
        };

        let cancel = CancellationToken::new();
        self.inner.set_state(EngineState::Idle);
        let handle = tokio::spawn(run_loop(Arc::clone(&self.inner), inbox, cancel.clone()));
        *lifecycle = Some(RunningLoop { cancel, handle });

        info!("Sync engine started");
        Ok(StartStatus::Started)
    }

    /// Quiesce the monitor, cancel the running pass and all transfers, wait
    /// for the loop and release the reservation
    ///
    /// The attached monitor is stopped even when the loop is not running.
    #[instrument(skip(self), fields(syncbox = %self.inner.context.syncbox_id()))]
    pub async fn stop(&self) -> StopStatus {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            self.inner.stop_monitor().await;
            return StopStatus::NotRunning;
        };

        info!("Stopping sync engine");
        self.inner.stop_monitor().await;

        running.cancel.cancel();
        self.inner.cancel_active_pass();
        self.inner.scheduler.cancel_all();

        if let Err(e) = running.handle.await {
            error!(error = %e, "Sync engine loop panicked");
        }

        self.inner.set_state(EngineState::Stopped);
        self.inner.context.reset_reservation();
        info!("Sync engine stopped");
        StopStatus::Stopped
    }

    /// Run one pass now and wait for its report
    ///
    /// When the engine is not started the pass takes the reservation for its
    /// own duration and first drains the change inbox.
    ///
    /// # Errors
    /// `Reservation` if another operation holds the syncbox, `Cancelled`,
    /// `Validation`, `Storage`, or `Transfer` for a failed remote fetch
    pub async fn run_pass(&self) -> Result<SyncReport, SyncError> {
        let standalone = self.inner.lifecycle.lock().await.is_none();
        if !standalone {
            return self.inner.execute_pass(None).await;
        }

        self.inner.context.try_reserve(ReservationOwner::SyncEngine)?;
        let result = async {
            self.inner.reload_pending().await?;
            if let Some(mut inbox) = self.inner.take_inbox() {
                self.inner.drain_changes(&mut inbox).await;
                self.inner.restore_inbox(inbox);
            }
            self.inner.execute_pass(None).await
        }
        .await;
        self.inner.context.reset_reservation();
        result
    }

    /// Delete all index state so the next pass starts from scratch
    ///
    /// # Errors
    /// `Validation` while the engine is running, `Reservation` if an
    /// operation holds the syncbox, `Storage` if the wipe fails
    #[instrument(skip(self))]
    pub async fn wipe_index(&self) -> Result<(), SyncError> {
        let lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(SyncError::Validation(
                "stop the sync engine before wiping its index".to_string(),
            ));
        }

        self.inner
            .context
            .try_reserve(ReservationOwner::Administrative("wipe index".to_string()))?;
        let result = self
            .inner
            .index
            .wipe_index(self.inner.tree.root())
            .await
            .map_err(SyncError::storage);
        if result.is_ok() {
            self.inner.pending.lock().await.clear();
            self.inner.update_pending_gauge(0);
            info!(root = %self.inner.tree.root().display(), "Local index wiped");
        }
        self.inner.context.reset_reservation();
        result
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("syncbox", &self.inner.context.syncbox_id())
            .field("root", &self.inner.tree.root())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Run loop
// ============================================================================

async fn run_loop(inner: Arc<EngineInner>, mut inbox: Inbox, cancel: CancellationToken) {
    let mut poll = inner.poll_interval.map(|every| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    let mut pass_due = true;

    loop {
        if pass_due {
            pass_due = false;
            // Outcome is published through state and events
            let _ = inner.execute_pass(Some(&cancel)).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            change = inbox.changes.recv() => {
                if let Some(change) = change {
                    inner.accept_change(change).await;
                    inner.drain_changes(&mut inbox).await;
                    pass_due = true;
                }
            }
            trigger = inbox.triggers.recv() => {
                if let Some(trigger) = trigger {
                    debug!(?trigger, "Pass requested");
                    pass_due = true;
                }
            }
            _ = next_tick(&mut poll) => {
                pass_due = true;
            }
        }
    }

    inner.drain_changes(&mut inbox).await;
    while inbox.triggers.try_recv().is_ok() {}
    inner.restore_inbox(inbox);
    debug!("Sync engine loop exited");
}

async fn next_tick(poll: &mut Option<tokio::time::Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn ensure_active(token: &CancellationToken) -> Result<(), SyncError> {
    if token.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

/// Race `fut` against `token`
async fn guarded<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output, SyncError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SyncError::Cancelled),
        out = fut => Ok(out),
    }
}

fn is_transient(err: &SyncError) -> bool {
    matches!(err, SyncError::Transfer(TransferError::Transient(_)))
}

/// `path` re-rooted from `from` to `to`; `path` lies below `from`
fn rebase(path: &RelativePath, from: &RelativePath, to: &RelativePath) -> Result<RelativePath, SyncError> {
    let suffix = &path.as_str()[from.as_str().len()..];
    Ok(RelativePath::new(format!("{to}{suffix}"))?)
}

// ============================================================================
// Pass bookkeeping
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Disposition {
    Applied,
    Discarded,
    /// Retried next pass; wins over any other outcome of the same record
    Pending,
}

struct PassState {
    report: SyncReport,
    entries: Vec<IndexEntry>,
    dispositions: BTreeMap<ChangeId, Disposition>,
    /// False once a remote change failed to apply
    cursor_safe: bool,
}

impl PassState {
    fn new(sync_id: SyncId) -> Self {
        Self {
            report: SyncReport::new(sync_id),
            entries: Vec::new(),
            dispositions: BTreeMap::new(),
            cursor_safe: true,
        }
    }

    fn settle(&mut self, id: ChangeId, disposition: Disposition) {
        let slot = self.dispositions.entry(id).or_insert(disposition);
        if disposition > *slot {
            *slot = disposition;
        }
    }

    /// A local change could not be applied on the server
    fn local_failed(&mut self, change: &ChangeRecord, err: SyncError) {
        warn!(path = %change.path(), id = %change.id(), error = %err, "Local change failed");
        let disposition = if is_transient(&err) {
            Disposition::Pending
        } else {
            Disposition::Discarded
        };
        self.settle(change.id(), disposition);
        self.report.errors.push(err);
    }

    /// A remote change could not be applied locally
    fn remote_failed(&mut self, change: &RemoteChange, err: SyncError) {
        warn!(path = %change.path, revision = change.revision, error = %err, "Remote change failed");
        self.cursor_safe = false;
        self.report.errors.push(err);
    }

    fn split(&self) -> (Vec<ChangeId>, Vec<ChangeId>) {
        let mut applied = Vec::new();
        let mut discarded = Vec::new();
        for (id, disposition) in &self.dispositions {
            match disposition {
                Disposition::Applied => applied.push(*id),
                Disposition::Discarded => discarded.push(*id),
                Disposition::Pending => {}
            }
        }
        (applied, discarded)
    }
}

enum Submitted {
    Upload(ChangeRecord),
    Download(ChangeId, RemoteChange),
}

// ============================================================================
// Engine internals
// ============================================================================

impl EngineInner {
    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Engine state changed");
            let _ = self.events.send(EngineEvent::StateChanged(state));
        }
    }

    fn take_inbox(&self) -> Option<Inbox> {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn restore_inbox(&self, inbox: Inbox) {
        *self.inbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbox);
    }

    fn cancel_active_pass(&self) {
        if let Some(token) = self
            .active_pass
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }

    async fn stop_monitor(&self) {
        if let Some(monitor) = self.monitor.lock().await.as_mut() {
            monitor.stop().await;
        }
    }

    fn update_pending_gauge(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_pending_changes(count);
        }
    }

    async fn reload_pending(&self) -> Result<(), SyncError> {
        if let Some(max) = self.index.max_change_id().await.map_err(SyncError::storage)? {
            self.ids.observe(max);
        }
        let stored = self.index.pending_changes().await.map_err(SyncError::storage)?;

        let mut pending = self.pending.lock().await;
        for record in stored {
            if record.direction() == Direction::LocalToRemote {
                self.ids.observe(record.id());
                pending.insert(record.id(), record);
            }
        }
        self.update_pending_gauge(pending.len());
        debug!(pending = pending.len(), "Queued local changes loaded");
        Ok(())
    }

    /// Persist and queue one local record
    async fn persist_change(&self, record: ChangeRecord) -> Result<(), SyncError> {
        self.ids.observe(record.id());
        self.index
            .append_change(&record)
            .await
            .map_err(SyncError::storage)?;
        let mut pending = self.pending.lock().await;
        pending.insert(record.id(), record);
        self.update_pending_gauge(pending.len());
        Ok(())
    }

    async fn accept_change(&self, record: ChangeRecord) {
        let (id, path) = (record.id(), record.path().clone());
        match self.persist_change(record).await {
            Ok(()) => debug!(id = %id, path = %path, "Local change queued"),
            Err(e) => error!(id = %id, path = %path, error = %e, "Failed to persist local change"),
        }
    }

    async fn drain_changes(&self, inbox: &mut Inbox) {
        while let Ok(change) = inbox.changes.try_recv() {
            self.accept_change(change).await;
        }
    }

    /// Run one pass with state, event and metric bookkeeping
    async fn execute_pass(&self, parent: Option<&CancellationToken>) -> Result<SyncReport, SyncError> {
        let _exclusive = self.pass_lock.lock().await;
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        *self.active_pass.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());

        let started = Instant::now();
        let result = self.pass(&token).await;
        let elapsed = started.elapsed();
        *self.active_pass.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let label = match &result {
            Ok(report) => {
                info!(
                    counter = %report.counter,
                    uploaded = report.uploaded,
                    downloaded = report.downloaded,
                    conflicts = report.conflicts.len(),
                    errors = report.errors.len(),
                    duration_ms = report.duration_ms,
                    "Sync pass committed"
                );
                self.set_state(EngineState::Idle);
                let _ = self.events.send(EngineEvent::PassCompleted(report.clone()));
                if report.is_clean() {
                    "success"
                } else {
                    "partial"
                }
            }
            Err(SyncError::Cancelled) => {
                info!("Sync pass cancelled");
                self.set_state(EngineState::Idle);
                let _ = self
                    .events
                    .send(EngineEvent::PassFailed(SyncError::Cancelled.to_string()));
                "cancelled"
            }
            Err(e) => {
                error!(error = %e, category = e.category(), "Sync pass failed");
                self.set_state(EngineState::Error);
                let _ = self.events.send(EngineEvent::PassFailed(e.to_string()));
                self.set_state(EngineState::Idle);
                "error"
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_pass(label, elapsed.as_secs_f64());
        }
        result
    }

    #[instrument(skip_all, fields(root = %self.tree.root().display()))]
    async fn pass(&self, token: &CancellationToken) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let sync_id = SyncId::new();
        let root: PathBuf = self.tree.root().to_path_buf();

        if let Some(stored) = self.index.root_path().await.map_err(SyncError::storage)? {
            if stored != root {
                return Err(SyncError::Validation(format!(
                    "index is bound to {} but the sync root is {}",
                    stored.display(),
                    root.display()
                )));
            }
        }

        // Indexing
        let counter = self.index.sync_counter().await.map_err(SyncError::storage)?;
        if counter == SyncCounter::ZERO
            && self.index.entries().await.map_err(SyncError::storage)?.is_empty()
        {
            self.set_state(EngineState::Indexing);
            self.index_local_tree(token).await?;
        }
        ensure_active(token)?;

        // Diffing
        self.set_state(EngineState::Diffing);
        let cursor = self.index.remote_cursor().await.map_err(SyncError::storage)?;
        let remote = guarded(token, self.remote.fetch_changes(cursor.as_deref())).await??;
        // Download records left by an aborted pass; refetched remote changes replace them
        let stale: Vec<ChangeId> = self
            .index
            .pending_changes()
            .await
            .map_err(SyncError::storage)?
            .into_iter()
            .filter(|record| record.direction() == Direction::RemoteToLocal)
            .map(|record| record.id())
            .collect();
        let local: Vec<ChangeRecord> = self.pending.lock().await.values().cloned().collect();
        let diff = self
            .index
            .diff(&remote.changes, &local)
            .await
            .map_err(SyncError::storage)?;
        debug!(
            remote = remote.changes.len(),
            local = local.len(),
            actions = diff.action_count(),
            conflicts = diff.conflicts.len(),
            "Diff computed"
        );

        // Executing
        self.set_state(EngineState::Executing);
        let mut state = PassState::new(sync_id);
        for id in stale {
            state.settle(id, Disposition::Discarded);
        }
        self.execute(diff, &mut state, token).await?;

        // Committing
        self.set_state(EngineState::Committing);
        ensure_active(token)?;
        let (applied, discarded) = state.split();
        let completed = CompletedSync {
            sync_id,
            root_path: root,
            applied_change_ids: applied.clone(),
            discarded_change_ids: discarded.clone(),
            entries: std::mem::take(&mut state.entries),
            conflicts: state.report.conflicts.clone(),
            remote_cursor: if state.cursor_safe {
                remote.next_cursor
            } else {
                None
            },
        };
        let counter = self
            .index
            .record_completed_sync(&completed)
            .await
            .map_err(SyncError::storage)?;

        {
            let mut pending = self.pending.lock().await;
            for id in applied.iter().chain(&discarded) {
                pending.remove(id);
            }
            self.update_pending_gauge(pending.len());
        }

        let mut report = state.report;
        report.counter = counter;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Queue a `Create` for everything already in the sync root
    async fn index_local_tree(&self, token: &CancellationToken) -> Result<(), SyncError> {
        let found = self.tree.walk().await.map_err(|e| {
            SyncError::Validation(format!(
                "cannot read sync root {}: {e}",
                self.tree.root().display()
            ))
        })?;

        let mut queued = 0usize;
        for entry in found {
            ensure_active(token)?;
            let mut builder =
                ChangeRecord::builder(ChangeKind::Create, Direction::LocalToRemote, entry.path.clone())
                    .folder(entry.state.is_folder)
                    .size(entry.state.size)
                    .modified_time(entry.state.modified);
            if !entry.state.is_folder {
                match self.tree.hash(&entry.path).await {
                    Ok(hash) => builder = builder.content_hash(hash),
                    Err(FsError::PathNotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            self.persist_change(builder.build(&self.ids)?).await?;
            queued += 1;
        }
        info!(queued, "Sync root indexed");
        Ok(())
    }

    async fn execute(
        &self,
        diff: DiffResult,
        state: &mut PassState,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let DiffResult {
            to_upload,
            to_download,
            to_delete_local,
            to_delete_remote,
            to_rename_local,
            to_rename_remote,
            adopt,
            conflicts,
            retired,
            discarded,
            skipped_remote,
        } = diff;

        state.report.skipped_remote = skipped_remote as u32;
        for id in retired {
            state.settle(id, Disposition::Applied);
            state.report.retired += 1;
        }
        for id in discarded {
            state.settle(id, Disposition::Discarded);
        }
        for conflict in conflicts {
            self.publish_conflict(&conflict);
            state.report.conflicts.push(conflict);
        }

        // Structure first: renames, then deletes
        for action in to_rename_remote {
            self.rename_remote(action, state, token).await?;
        }
        for action in to_delete_remote {
            self.delete_remote(action, state, token).await?;
        }
        let mut to_download = to_download;
        for action in to_rename_local {
            if let Some(fallback) = self.rename_local(action, state).await? {
                to_download.push(fallback);
            }
        }
        for action in to_delete_local {
            self.delete_local(action, state).await?;
        }
        for action in adopt {
            state
                .entries
                .push(action.change.to_index_entry(SyncCounter::ZERO));
            state.report.adopted += 1;
        }

        // Content
        let mut submitted: Vec<(TransferHandle, Submitted)> = Vec::new();
        for action in to_upload {
            if action.change.is_folder() {
                self.create_remote_folder(&action.change, state, token).await?;
                continue;
            }
            if let Some(job) = self.submit_upload(action, state).await? {
                submitted.push(job);
            }
        }
        for action in to_download {
            if action.change.is_folder {
                self.create_local_folder(action.change, state).await;
                continue;
            }
            submitted.push(self.submit_download(action.change).await?);
        }

        self.await_transfers(submitted, state, token).await
    }

    fn publish_conflict(&self, conflict: &ConflictReport) {
        match conflict.winner {
            ConflictSide::Remote => warn!(
                path = %conflict.path,
                id = %conflict.local_change_id,
                error = %conflict.to_error(),
                "Local change lost a conflict and was discarded"
            ),
            ConflictSide::Local => info!(
                path = %conflict.path,
                reason = %conflict.reason(),
                "Local change won a conflict"
            ),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_conflict(conflict.winner.as_str());
        }
        let _ = self.events.send(EngineEvent::Conflict(conflict.clone()));
    }

    /// Index entries below `from`, moved to `to`, plus tombstones for the old paths
    async fn moved_children(
        &self,
        from: &RelativePath,
        to: &RelativePath,
    ) -> Result<Vec<IndexEntry>, SyncError> {
        let mut moved = Vec::new();
        for child in self
            .index
            .entries_under(from)
            .await
            .map_err(SyncError::storage)?
        {
            if !child.is_live() {
                continue;
            }
            let path = rebase(&child.path, from, to)?;
            moved.push(child.tombstone(None));
            moved.push(IndexEntry { path, ..child });
        }
        Ok(moved)
    }

    async fn removed_children(
        &self,
        folder: &RelativePath,
        revision: Option<u64>,
    ) -> Result<Vec<IndexEntry>, SyncError> {
        Ok(self
            .index
            .entries_under(folder)
            .await
            .map_err(SyncError::storage)?
            .into_iter()
            .filter(IndexEntry::is_live)
            .map(|child| child.tombstone(revision))
            .collect())
    }

    async fn rename_remote(
        &self,
        action: LocalAction,
        state: &mut PassState,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let change = &action.change;
        let Some(from) = change.previous_path() else {
            state.settle(change.id(), Disposition::Applied);
            return Ok(());
        };
        let uid = action.entry.as_ref().and_then(|e| e.server_uid.as_ref());

        match guarded(token, self.remote.rename(from, change.path(), uid)).await? {
            Ok(item) => {
                if change.is_folder() {
                    let moved = self.moved_children(from, change.path()).await?;
                    state.entries.extend(moved);
                }
                if let Some(previous) = &action.entry {
                    state.entries.push(previous.tombstone(None));
                }
                state.entries.push(item.to_index_entry(SyncCounter::ZERO));
                state.settle(change.id(), Disposition::Applied);
                state.report.renamed_remote += 1;
                debug!(from = %from, to = %change.path(), "Renamed on server");
            }
            Err(e) => state.local_failed(change, e.into()),
        }
        Ok(())
    }

    async fn delete_remote(
        &self,
        action: LocalAction,
        state: &mut PassState,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let change = &action.change;
        let uid = action.entry.as_ref().and_then(|e| e.server_uid.as_ref());

        match guarded(token, self.remote.delete(change.path(), uid)).await? {
            Ok(()) => {
                if let Some(entry) = &action.entry {
                    if entry.is_folder {
                        let removed = self.removed_children(change.path(), None).await?;
                        state.entries.extend(removed);
                    }
                    state.entries.push(entry.tombstone(None));
                }
                state.settle(change.id(), Disposition::Applied);
                state.report.deleted_remote += 1;
                debug!(path = %change.path(), "Deleted on server");
            }
            Err(e) => state.local_failed(change, e.into()),
        }
        Ok(())
    }

    /// Apply a server rename locally; returns a download to run instead when
    /// the local source is already gone
    async fn rename_local(
        &self,
        action: RemoteAction,
        state: &mut PassState,
    ) -> Result<Option<RemoteAction>, SyncError> {
        let change = action.change;
        let Some(from) = change.previous_path.clone() else {
            return Ok(None);
        };

        match self.tree.rename(&from, &change.path).await {
            Ok(()) => {
                if change.is_folder {
                    let moved = self.moved_children(&from, &change.path).await?;
                    state.entries.extend(moved);
                }
                let mut renamed = change.to_index_entry(SyncCounter::ZERO);
                if let Some(previous) = &action.entry {
                    state.entries.push(previous.tombstone(Some(change.revision)));
                    if !change.is_folder {
                        // the bytes on disk are the ones the old entry described
                        renamed.content_hash = previous.content_hash.clone();
                    }
                }
                state.entries.push(renamed);
                state.report.renamed_local += 1;
                debug!(from = %from, to = %change.path, "Renamed locally");
                Ok(None)
            }
            Err(FsError::PathNotFound(_)) if !change.is_folder => {
                debug!(from = %from, to = %change.path, "Rename source missing, downloading");
                if let Some(previous) = &action.entry {
                    state.entries.push(previous.tombstone(Some(change.revision)));
                }
                Ok(Some(RemoteAction {
                    change: RemoteChange {
                        previous_path: None,
                        ..change
                    },
                    entry: None,
                }))
            }
            Err(e) => {
                state.remote_failed(&change, e.into());
                Ok(None)
            }
        }
    }

    async fn delete_local(&self, action: RemoteAction, state: &mut PassState) -> Result<(), SyncError> {
        let change = &action.change;
        match self.tree.remove(&change.path).await {
            Ok(()) => {
                if let Some(entry) = &action.entry {
                    if entry.is_folder {
                        let removed = self
                            .removed_children(&change.path, Some(change.revision))
                            .await?;
                        state.entries.extend(removed);
                    }
                    state.entries.push(entry.tombstone(Some(change.revision)));
                }
                state.report.deleted_local += 1;
                debug!(path = %change.path, "Deleted locally");
            }
            Err(e) => state.remote_failed(change, e.into()),
        }
        Ok(())
    }

    async fn create_local_folder(&self, change: RemoteChange, state: &mut PassState) {
        match self.tree.create_dir(&change.path).await {
            Ok(()) => {
                state.entries.push(change.to_index_entry(SyncCounter::ZERO));
                state.report.folders_created += 1;
            }
            Err(e) => state.remote_failed(&change, e.into()),
        }
    }

    async fn create_remote_folder(
        &self,
        change: &ChangeRecord,
        state: &mut PassState,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        match guarded(token, self.remote.create_folder(change.path())).await? {
            Ok(item) => {
                state.entries.push(item.to_index_entry(SyncCounter::ZERO));
                state.settle(change.id(), Disposition::Applied);
                state.report.folders_created += 1;
            }
            Err(e) => state.local_failed(change, e.into()),
        }
        Ok(())
    }

    async fn submit_upload(
        &self,
        action: LocalAction,
        state: &mut PassState,
    ) -> Result<Option<(TransferHandle, Submitted)>, SyncError> {
        let change = action.change;
        match self.tree.stat(change.path()).await {
            Ok(Some(local)) if !local.is_folder => {}
            Ok(_) => {
                // gone or replaced by a folder; a newer record describes it
                debug!(path = %change.path(), "Upload source vanished, retiring record");
                state.settle(change.id(), Disposition::Applied);
                return Ok(None);
            }
            Err(e) => {
                state.local_failed(&change, e.into());
                return Ok(None);
            }
        }

        let request = UploadRequest {
            path: change.path().clone(),
            source: self.tree.absolute(change.path()),
            size: change.size(),
            content_hash: change.content_hash().cloned(),
            is_folder: false,
            server_uid: action.entry.as_ref().and_then(|e| e.server_uid.clone()),
            base_revision: action.entry.as_ref().map(|e| e.revision),
        };
        let handle = self
            .scheduler
            .submit(TransferRequest::upload(change.id(), request))
            .map_err(|_| SyncError::Cancelled)?;
        Ok(Some((handle, Submitted::Upload(change))))
    }

    async fn submit_download(
        &self,
        change: RemoteChange,
    ) -> Result<(TransferHandle, Submitted), SyncError> {
        // Downloads are tracked in the change log like any other record
        let record = change.to_change_record(&self.ids)?;
        self.index
            .append_change(&record)
            .await
            .map_err(SyncError::storage)?;

        let request = DownloadRequest {
            path: change.path.clone(),
            server_uid: change.server_uid.clone(),
            target: self.tree.absolute(&change.path),
            size: change.size,
            revision: change.revision,
            content_hash: change.content_hash.clone(),
        };
        let handle = self
            .scheduler
            .submit(TransferRequest::download(record.id(), request))
            .map_err(|_| SyncError::Cancelled)?;
        Ok((handle, Submitted::Download(record.id(), change)))
    }

    /// Entry for a finished download, hashed from the bytes on disk so the
    /// monitor's echo of the download matches it
    async fn downloaded_entry(&self, change: &RemoteChange) -> IndexEntry {
        let mut entry = change.to_index_entry(SyncCounter::ZERO);
        match self.tree.hash(&change.path).await {
            Ok(hash) => entry.content_hash = Some(hash),
            Err(e) => warn!(path = %change.path, error = %e, "Cannot hash downloaded file"),
        }
        entry
    }

    async fn await_transfers(
        &self,
        submitted: Vec<(TransferHandle, Submitted)>,
        state: &mut PassState,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let cancel_all = |jobs: &[(TransferHandle, Submitted)]| {
            for (handle, _) in jobs {
                handle.cancel();
            }
        };

        for (handle, job) in &submitted {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    cancel_all(&submitted);
                    return Err(SyncError::Cancelled);
                }
                outcome = handle.outcome() => outcome,
            };

            match (outcome, job) {
                (TransferOutcome::Completed(item), Submitted::Upload(change)) => {
                    if let Some(item) = item {
                        let mut entry = item.to_index_entry(SyncCounter::ZERO);
                        if let Some(hash) = change.content_hash() {
                            entry.content_hash = Some(hash.clone());
                        }
                        state.entries.push(entry);
                    }
                    state.settle(change.id(), Disposition::Applied);
                    state.report.uploaded += 1;
                }
                (TransferOutcome::Completed(_), Submitted::Download(id, change)) => {
                    state.entries.push(self.downloaded_entry(change).await);
                    state.settle(*id, Disposition::Applied);
                    state.report.downloaded += 1;
                }
                (TransferOutcome::Cancelled, _) => {
                    cancel_all(&submitted);
                    return Err(SyncError::Cancelled);
                }
                (TransferOutcome::Failed(err), Submitted::Upload(change)) => {
                    state.local_failed(change, err.into());
                }
                (TransferOutcome::Failed(err), Submitted::Download(id, change)) => {
                    state.settle(*id, Disposition::Discarded);
                    state.remote_failed(change, err.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(path: &str) -> RelativePath {
        RelativePath::new(path).unwrap()
    }

    #[test]
    fn test_working_states() {
        assert!(EngineState::Diffing.is_working());
        assert!(EngineState::Committing.is_working());
        assert!(!EngineState::Idle.is_working());
        assert!(!EngineState::Error.is_working());
        assert_eq!(EngineState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_rebase_moves_descendants() {
        let moved = rebase(&rel("docs/a/b.txt"), &rel("docs"), &rel("archive/docs")).unwrap();
        assert_eq!(moved.as_str(), "archive/docs/a/b.txt");
    }

    #[test]
    fn test_pending_disposition_wins() {
        let mut state = PassState::new(SyncId::new());
        let id = ChangeId::new(4);
        state.settle(id, Disposition::Applied);
        state.settle(id, Disposition::Pending);
        state.settle(id, Disposition::Discarded);

        let (applied, discarded) = state.split();
        assert!(applied.is_empty());
        assert!(discarded.is_empty());
    }

    #[test]
    fn test_discard_overrides_applied() {
        let mut state = PassState::new(SyncId::new());
        state.settle(ChangeId::new(1), Disposition::Applied);
        state.settle(ChangeId::new(2), Disposition::Applied);
        state.settle(ChangeId::new(2), Disposition::Discarded);

        let (applied, discarded) = state.split();
        assert_eq!(applied, vec![ChangeId::new(1)]);
        assert_eq!(discarded, vec![ChangeId::new(2)]);
    }

    #[test]
    fn test_transient_local_failure_stays_queued() {
        let mut state = PassState::new(SyncId::new());
        let change = ChangeRecord::builder(ChangeKind::Modify, Direction::LocalToRemote, rel("a.txt"))
            .restore(ChangeId::new(9))
            .unwrap();

        state.local_failed(&change, TransferError::Transient("503".into()).into());
        let (applied, discarded) = state.split();
        assert!(applied.is_empty() && discarded.is_empty());
        assert_eq!(state.report.errors.len(), 1);
        assert!(state.cursor_safe);
    }
}
