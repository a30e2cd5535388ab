//! Transfer Scheduler
//!
//! Runs uploads and downloads against an [`IRemoteStore`] with bounded,
//! independent concurrency per direction.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──→ upload queue ──→ dispatcher ──→ Semaphore(max_uploads) ──→ workers
//!  submit() ──────┤
//!                 └──→ download queue ─→ dispatcher ──→ Semaphore(max_downloads) ─→ workers
//! ```
//!
//! Each dispatcher takes jobs from its queue in submission order and only
//! takes the next one once a permit is free, so waiting jobs start FIFO.
//! Every transfer gets a [`CancellationToken`] that is a child of the
//! scheduler's root token; the remote operation and backoff sleeps are raced
//! against it.
//!
//! In-flight state ([`PendingTransfer`]) lives in a `DashMap` owned by the
//! scheduler. Other components only see cloned snapshots.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use syncbox_core::config::TransfersConfig;
use syncbox_core::domain::{ChangeId, Direction, RemoteItem, TransferError};
use syncbox_core::ports::{DownloadRequest, IRemoteStore, ProgressReporter, UploadRequest};

use crate::backoff::Backoff;
use crate::metrics::SyncMetrics;

// ============================================================================
// Public types
// ============================================================================

/// Identifier the scheduler assigns to each submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// The network operation a transfer performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferJob {
    Upload(UploadRequest),
    Download(DownloadRequest),
}

impl TransferJob {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Upload(_) => Direction::LocalToRemote,
            Self::Download(_) => Direction::RemoteToLocal,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Upload(req) => req.size,
            Self::Download(req) => req.size,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Upload(_) => "upload",
            Self::Download(_) => "download",
        }
    }
}

/// One submission: the change record it serves and the work to do
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub change_id: ChangeId,
    pub job: TransferJob,
    pub progress: ProgressReporter,
}

impl TransferRequest {
    pub fn upload(change_id: ChangeId, request: UploadRequest) -> Self {
        Self {
            change_id,
            job: TransferJob::Upload(request),
            progress: ProgressReporter::noop(),
        }
    }

    pub fn download(change_id: ChangeId, request: DownloadRequest) -> Self {
        Self {
            change_id,
            job: TransferJob::Download(request),
            progress: ProgressReporter::noop(),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }
}

/// Snapshot of one in-flight transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub id: TransferId,
    pub change_id: ChangeId,
    pub direction: Direction,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub cancellation_requested: bool,
    /// Attempts started so far (zero while queued)
    pub attempt: u32,
}

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Uploads carry the server's view of the item
    Completed(Option<RemoteItem>),
    Cancelled,
    /// Always [`TransferError::Permanent`]; transient errors are retried
    /// until they become permanent
    Failed(TransferError),
}

impl TransferOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Submission after [`TransferScheduler::dispose_both`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Transfer scheduler has been disposed")]
pub struct SchedulerClosed;

/// Concurrency and retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    /// Total attempts per transfer, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl TransferConfig {
    pub fn from_settings(settings: &TransfersConfig) -> Self {
        Self {
            max_concurrent_uploads: settings.max_concurrent_uploads,
            max_concurrent_downloads: settings.max_concurrent_downloads,
            max_attempts: settings.max_attempts,
            backoff: Backoff::new(
                std::time::Duration::from_millis(settings.backoff_base_ms),
                std::time::Duration::from_millis(settings.backoff_max_ms),
                true,
            ),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::from_settings(&TransfersConfig::default())
    }
}

// ============================================================================
// TransferHandle
// ============================================================================

/// Caller's view of a submitted transfer
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: TransferId,
    token: CancellationToken,
    outcome: watch::Receiver<Option<TransferOutcome>>,
    shared: Arc<Shared>,
}

impl TransferHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Request cancellation; the outcome becomes `Cancelled` unless the
    /// transfer already finished
    pub fn cancel(&self) {
        self.shared.mark_cancelled(self.id);
        self.token.cancel();
    }

    /// Current state, or `None` once the transfer has finished
    pub fn snapshot(&self) -> Option<PendingTransfer> {
        self.shared
            .transfers
            .get(&self.id)
            .map(|t| t.snapshot.clone())
    }

    /// Wait for the transfer to finish
    pub async fn outcome(&self) -> TransferOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or(TransferOutcome::Cancelled),
            Err(_) => TransferOutcome::Failed(TransferError::Permanent(
                "transfer worker exited without reporting".to_string(),
            )),
        };
        outcome
    }
}

// ============================================================================
// Shared worker state
// ============================================================================

struct Tracked {
    snapshot: PendingTransfer,
    token: CancellationToken,
}

struct Shared {
    store: Arc<dyn IRemoteStore>,
    config: TransferConfig,
    transfers: DashMap<TransferId, Tracked>,
    root: CancellationToken,
    metrics: Option<Arc<SyncMetrics>>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("in_flight", &self.transfers.len())
            .finish()
    }
}

impl Shared {
    fn mark_cancelled(&self, id: TransferId) {
        if let Some(mut tracked) = self.transfers.get_mut(&id) {
            tracked.snapshot.cancellation_requested = true;
        }
    }

    fn set_attempt(&self, id: TransferId, attempt: u32) {
        if let Some(mut tracked) = self.transfers.get_mut(&id) {
            tracked.snapshot.attempt = attempt;
        }
    }
}

struct Job {
    id: TransferId,
    request: TransferRequest,
    token: CancellationToken,
    done: watch::Sender<Option<TransferOutcome>>,
}

struct Pool {
    direction: Direction,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    semaphore: Arc<Semaphore>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    fn start(shared: &Arc<Shared>, direction: Direction, permits: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(permits.max(1)));
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(shared),
            Arc::clone(&semaphore),
            rx,
        ));
        Self {
            direction,
            sender: Mutex::new(Some(tx)),
            semaphore,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    fn send(&self, job: Job) -> Result<(), SchedulerClosed> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| SchedulerClosed),
            None => Err(SchedulerClosed),
        }
    }

    async fn shutdown(&self) {
        // Dropping the sender ends the dispatcher once its queue is drained
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.semaphore.close();
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(direction = %self.direction, error = %e, "Dispatcher task failed");
            }
        }
    }
}

// ============================================================================
// TransferScheduler
// ============================================================================

/// Bounded, retrying, cancellable executor for uploads and downloads
pub struct TransferScheduler {
    shared: Arc<Shared>,
    uploads: Pool,
    downloads: Pool,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl TransferScheduler {
    /// Starts both dispatchers; must be called inside a Tokio runtime
    pub fn new(
        store: Arc<dyn IRemoteStore>,
        config: TransferConfig,
        metrics: Option<Arc<SyncMetrics>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            config,
            transfers: DashMap::new(),
            root: CancellationToken::new(),
            metrics,
        });

        info!(
            max_uploads = config.max_concurrent_uploads,
            max_downloads = config.max_concurrent_downloads,
            max_attempts = config.max_attempts,
            "Transfer scheduler started"
        );

        Self {
            uploads: Pool::start(&shared, Direction::LocalToRemote, config.max_concurrent_uploads),
            downloads: Pool::start(
                &shared,
                Direction::RemoteToLocal,
                config.max_concurrent_downloads,
            ),
            shared,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.shared.config
    }

    /// Queue a transfer; it waits FIFO if its pool is full
    ///
    /// # Errors
    /// Returns [`SchedulerClosed`] after [`dispose_both`](Self::dispose_both)
    pub fn submit(&self, request: TransferRequest) -> Result<TransferHandle, SchedulerClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerClosed);
        }

        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let direction = request.job.direction();
        let token = self.shared.root.child_token();
        let (done, outcome) = watch::channel(None);

        self.shared.transfers.insert(
            id,
            Tracked {
                snapshot: PendingTransfer {
                    id,
                    change_id: request.change_id,
                    direction,
                    bytes_transferred: 0,
                    total_bytes: request.job.size(),
                    cancellation_requested: false,
                    attempt: 0,
                },
                token: token.clone(),
            },
        );

        debug!(
            transfer = %id,
            change_id = %request.change_id,
            kind = request.job.label(),
            "Transfer queued"
        );

        let job = Job {
            id,
            request,
            token: token.clone(),
            done,
        };
        let pool = match direction {
            Direction::LocalToRemote => &self.uploads,
            Direction::RemoteToLocal => &self.downloads,
        };
        if let Err(closed) = pool.send(job) {
            self.shared.transfers.remove(&id);
            return Err(closed);
        }

        Ok(TransferHandle {
            id,
            token,
            outcome,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Snapshot of a transfer by id
    pub fn snapshot(&self, id: TransferId) -> Option<PendingTransfer> {
        self.shared.transfers.get(&id).map(|t| t.snapshot.clone())
    }

    /// Snapshots of everything queued or running
    pub fn in_flight(&self) -> Vec<PendingTransfer> {
        let mut all: Vec<_> = self
            .shared
            .transfers
            .iter()
            .map(|t| t.snapshot.clone())
            .collect();
        all.sort_by_key(|t| t.id);
        all
    }

    /// Cancel all outstanding transfers; new submissions are still accepted
    pub fn cancel_all(&self) {
        let mut cancelled = 0usize;
        for mut tracked in self.shared.transfers.iter_mut() {
            tracked.snapshot.cancellation_requested = true;
            tracked.token.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(cancelled, "Cancelled outstanding transfers");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancel everything, wait for both pools to drain and refuse further
    /// submissions
    ///
    /// Idempotent; later calls return immediately.
    pub async fn dispose_both(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Disposing transfer schedulers");
        self.shared.root.cancel();
        self.uploads.shutdown().await;
        self.downloads.shutdown().await;
        debug!("Transfer schedulers disposed");
    }
}

impl fmt::Debug for TransferScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferScheduler")
            .field("shared", &self.shared)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Dispatcher and workers
// ============================================================================

async fn dispatch(
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    mut queue: mpsc::UnboundedReceiver<Job>,
) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            job = queue.recv() => {
                let Some(job) = job else { break };
                let permit = tokio::select! {
                    permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
                    _ = job.token.cancelled() => None,
                };
                match permit {
                    Some(permit) => {
                        let shared = Arc::clone(&shared);
                        workers.spawn(async move {
                            let _permit = permit;
                            run_job(shared, job).await;
                        });
                    }
                    None => finish(&shared, job, TransferOutcome::Cancelled),
                }
            }
            Some(_) = workers.join_next(), if !workers.is_empty() => {}
        }
    }

    while workers.join_next().await.is_some() {}
}

async fn run_job(shared: Arc<Shared>, job: Job) {
    let outcome = execute(&shared, &job).await;
    finish(&shared, job, outcome);
}

fn finish(shared: &Shared, job: Job, outcome: TransferOutcome) {
    let kind = job.request.job.label();
    shared.transfers.remove(&job.id);

    match &outcome {
        TransferOutcome::Completed(_) => {
            debug!(transfer = %job.id, kind, "Transfer completed");
        }
        TransferOutcome::Cancelled => {
            debug!(transfer = %job.id, kind, "Transfer cancelled");
        }
        TransferOutcome::Failed(e) => {
            warn!(transfer = %job.id, kind, error = %e, "Transfer failed");
        }
    }

    if let Some(metrics) = &shared.metrics {
        metrics.record_transfer(kind, outcome.label());
        if matches!(outcome, TransferOutcome::Completed(_)) {
            metrics.record_bytes(kind, job.request.job.size());
        }
    }

    // Nobody waiting is fine
    let _ = job.done.send(Some(outcome));
}

async fn execute(shared: &Arc<Shared>, job: &Job) -> TransferOutcome {
    let max_attempts = shared.config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if job.token.is_cancelled() {
            return TransferOutcome::Cancelled;
        }
        shared.set_attempt(job.id, attempt);

        let result = tokio::select! {
            biased;
            _ = job.token.cancelled() => return TransferOutcome::Cancelled,
            result = perform(shared, job) => result,
        };

        match result {
            Ok(item) => return TransferOutcome::Completed(item),
            Err(_) if job.token.is_cancelled() => return TransferOutcome::Cancelled,
            Err(TransferError::Transient(reason)) if attempt < max_attempts => {
                let delay = shared.config.backoff.delay(attempt - 1);
                warn!(
                    transfer = %job.id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient transfer failure, retrying"
                );
                if let Some(metrics) = &shared.metrics {
                    metrics.record_retry(job.request.job.label());
                }
                tokio::select! {
                    _ = job.token.cancelled() => return TransferOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(TransferError::Transient(reason)) => {
                return TransferOutcome::Failed(TransferError::Permanent(format!(
                    "retries exhausted after {attempt} attempts: {reason}"
                )));
            }
            Err(permanent) => return TransferOutcome::Failed(permanent),
        }
    }
}

async fn perform(shared: &Arc<Shared>, job: &Job) -> Result<Option<RemoteItem>, TransferError> {
    let id = job.id;
    let tracker = Arc::clone(shared);
    let user = job.request.progress.clone();
    let progress = ProgressReporter::new(move |done, total| {
        if let Some(mut tracked) = tracker.transfers.get_mut(&id) {
            tracked.snapshot.bytes_transferred = done;
            tracked.snapshot.total_bytes = total;
        }
        user.report(done, total);
    });

    match &job.request.job {
        TransferJob::Upload(request) => shared
            .store
            .upload(request, &progress, &job.token)
            .await
            .map(Some),
        TransferJob::Download(request) => shared
            .store
            .download(request, &progress, &job.token)
            .await
            .map(|()| None),
    }
}
