//! File System Monitor
//!
//! Provides a [`FileSystemMonitor`] that wraps the `notify` crate to watch the
//! sync root, converting raw OS events into [`FsEvent`] values and then into
//! `LocalToRemote` [`ChangeRecord`]s for the delay/dedup processor.
//!
//! ## Architecture
//!
//! ```text
//! inotify / FSEvents / kqueue
//!       │
//!       ▼
//!  notify callback ──→ mpsc<FsEvent> ──→ translator task ──→ DelayProcessor ──→ engine
//!                                        (stat + SHA-256)
//! ```
//!
//! Renames arrive from notify as `From`, `To` and `Both` events. `From` is
//! mapped to a delete and `To` to a create; the processor folds both into
//! the final rename.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use syncbox_core::domain::{ChangeIdGenerator, ChangeKind, ChangeRecord, Direction, RelativePath};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::debounce::DelayProcessor;
use crate::filesystem::LocalTree;
use crate::FsError;

// ============================================================================
// FsEvent
// ============================================================================

/// A filesystem change as reported by the OS, before translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A new file or directory was created at the given path
    Created(PathBuf),
    /// An existing file was modified (content or metadata changed)
    Modified(PathBuf),
    /// A file or directory was deleted from the given path
    Deleted(PathBuf),
    /// A file or directory was renamed/moved
    Renamed {
        /// The original path before the rename
        old: PathBuf,
        /// The new path after the rename
        new: PathBuf,
    },
}

/// Converts a `notify::Event` into an [`FsEvent`]
///
/// Returns `None` for events without paths and for access events.
fn map_notify_event(event: &notify::Event) -> Option<FsEvent> {
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(_) => Some(FsEvent::Created(paths.first()?.clone())),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if paths.len() >= 2 {
                Some(FsEvent::Renamed {
                    old: paths[0].clone(),
                    new: paths[1].clone(),
                })
            } else {
                Some(FsEvent::Modified(paths.first()?.clone()))
            }
        }

        // Moved out of (or within) the tree; a Both event follows for moves within
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(FsEvent::Deleted(paths.first()?.clone()))
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Some(FsEvent::Created(paths.first()?.clone()))
        }

        EventKind::Modify(_) => Some(FsEvent::Modified(paths.first()?.clone())),

        EventKind::Remove(_) => Some(FsEvent::Deleted(paths.first()?.clone())),

        _ => None,
    }
}

// ============================================================================
// Translation to change records
// ============================================================================

/// Builds the change record an event stands for
///
/// `Ok(None)` means the event carries nothing to sync: ignored paths,
/// folder metadata churn, or a path that vanished before it could be read.
async fn translate(
    tree: &LocalTree,
    ids: &ChangeIdGenerator,
    event: FsEvent,
) -> Result<Option<ChangeRecord>, FsError> {
    match event {
        FsEvent::Created(abs) => match tree.relative(&abs) {
            Some(path) => describe(tree, ids, ChangeKind::Create, path, None).await,
            None => Ok(None),
        },
        FsEvent::Modified(abs) => {
            let Some(path) = tree.relative(&abs) else {
                return Ok(None);
            };
            match tree.stat(&path).await? {
                Some(state) if !state.is_folder => {
                    describe(tree, ids, ChangeKind::Modify, path, None).await
                }
                _ => Ok(None),
            }
        }
        FsEvent::Deleted(abs) => match tree.relative(&abs) {
            Some(path) => Ok(Some(
                ChangeRecord::builder(ChangeKind::Delete, Direction::LocalToRemote, path)
                    .modified_time(Utc::now())
                    .build(ids)?,
            )),
            None => Ok(None),
        },
        FsEvent::Renamed { old, new } => match (tree.relative(&old), tree.relative(&new)) {
            (Some(from), Some(to)) => describe(tree, ids, ChangeKind::Rename, to, Some(from)).await,
            // partial download moved into place, or moved in from outside
            (None, Some(to)) => describe(tree, ids, ChangeKind::Create, to, None).await,
            (Some(from), None) => Ok(Some(
                ChangeRecord::builder(ChangeKind::Delete, Direction::LocalToRemote, from)
                    .modified_time(Utc::now())
                    .build(ids)?,
            )),
            (None, None) => Ok(None),
        },
    }
}

async fn describe(
    tree: &LocalTree,
    ids: &ChangeIdGenerator,
    kind: ChangeKind,
    path: RelativePath,
    previous: Option<RelativePath>,
) -> Result<Option<ChangeRecord>, FsError> {
    let Some(state) = tree.stat(&path).await? else {
        return Ok(None);
    };

    let mut builder = ChangeRecord::builder(kind, Direction::LocalToRemote, path.clone())
        .folder(state.is_folder)
        .size(state.size)
        .modified_time(state.modified);
    if let Some(previous) = previous {
        builder = builder.previous_path(previous);
    }
    if !state.is_folder {
        match tree.hash(&path).await {
            Ok(hash) => builder = builder.content_hash(hash),
            Err(FsError::PathNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(builder.build(ids)?))
}

async fn run_translator(
    tree: LocalTree,
    ids: Arc<ChangeIdGenerator>,
    processor: DelayProcessor<ChangeRecord>,
    mut events: mpsc::Receiver<FsEvent>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match translate(&tree, &ids, event.clone()).await {
            Ok(Some(record)) => {
                debug!(
                    path = %record.path(),
                    kind = %record.kind(),
                    id = %record.id(),
                    "Local change captured"
                );
                processor.enqueue(record);
            }
            Ok(None) => {}
            Err(e) => warn!(event = ?event, error = %e, "Failed to read changed path"),
        }
    }
    debug!("Monitor translator stopped");
}

// ============================================================================
// FileSystemMonitor
// ============================================================================

/// Watches the sync root and feeds local changes into a delay processor
///
/// The monitor keeps what it was started with, so a stopped monitor can be
/// brought back with [`restart`](Self::restart).
///
/// ## Usage
///
/// ```ignore
/// let (tx, rx) = mpsc::channel(1024);
/// let mut monitor = FileSystemMonitor::start(tree, ids, Duration::from_secs(2), tx)?;
/// // rx yields coalesced ChangeRecords
/// monitor.stop().await;
/// monitor.restart()?;
/// ```
pub struct FileSystemMonitor {
    tree: LocalTree,
    ids: Arc<ChangeIdGenerator>,
    idle: Duration,
    downstream: mpsc::Sender<ChangeRecord>,
    /// Processor of the current (or last) watch session
    processor: DelayProcessor<ChangeRecord>,
    session: Option<WatchSession>,
}

/// Everything that lives between a start and the matching stop
struct WatchSession {
    watcher: RecommendedWatcher,
    processor_task: JoinHandle<()>,
    translator: JoinHandle<()>,
    stop: CancellationToken,
}

impl FileSystemMonitor {
    /// Start watching `tree`'s root recursively
    ///
    /// Coalesced records are sent to `downstream` once their path has been
    /// idle for `idle`.
    ///
    /// # Errors
    /// Returns an error if the OS watcher cannot be created or the root
    /// cannot be watched (missing, permissions, watch limit reached)
    pub fn start(
        tree: LocalTree,
        ids: Arc<ChangeIdGenerator>,
        idle: Duration,
        downstream: mpsc::Sender<ChangeRecord>,
    ) -> Result<Self> {
        let (processor, session) = Self::open_session(&tree, &ids, idle, &downstream)?;
        Ok(Self {
            tree,
            ids,
            idle,
            downstream,
            processor,
            session: Some(session),
        })
    }

    /// Watch again after [`stop`](Self::stop) with a fresh processor
    ///
    /// No-op while running.
    ///
    /// # Errors
    /// Same as [`start`](Self::start)
    pub fn restart(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let (processor, session) =
            Self::open_session(&self.tree, &self.ids, self.idle, &self.downstream)?;
        self.processor = processor;
        self.session = Some(session);
        Ok(())
    }

    fn open_session(
        tree: &LocalTree,
        ids: &Arc<ChangeIdGenerator>,
        idle: Duration,
        downstream: &mpsc::Sender<ChangeRecord>,
    ) -> Result<(DelayProcessor<ChangeRecord>, WatchSession)> {
        let (event_tx, event_rx) = mpsc::channel::<FsEvent>(1024);
        let root = tree.root();

        info!(root = %root.display(), idle_ms = idle.as_millis() as u64, "Starting file system monitor");

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(e) = event_tx.blocking_send(change) {
                            warn!(error = %e, "Failed to forward file event (monitor stopped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", root.display()))?;

        let (processor, processor_task) = DelayProcessor::spawn(idle, downstream.clone());
        let stop = CancellationToken::new();
        let translator = tokio::spawn(run_translator(
            tree.clone(),
            Arc::clone(ids),
            processor.clone(),
            event_rx,
            stop.clone(),
        ));

        Ok((
            processor,
            WatchSession {
                watcher,
                processor_task,
                translator,
                stop,
            },
        ))
    }

    /// Handle to the current processor, e.g. to inject records found by other means
    pub fn processor(&self) -> DelayProcessor<ChangeRecord> {
        self.processor.clone()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Stop watching, flush the processor and wait for both tasks
    ///
    /// Idempotent.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        info!(root = %self.tree.root().display(), "Stopping file system monitor");
        drop(session.watcher);

        session.stop.cancel();
        if let Err(e) = session.translator.await {
            warn!(error = %e, "Monitor translator task failed");
        }

        self.processor.terminate_all_processing();
        if let Err(e) = session.processor_task.await {
            warn!(error = %e, "Delay processor task failed");
        }
    }
}

impl std::fmt::Debug for FileSystemMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemMonitor")
            .field("root", &self.tree.root())
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Unit tests
// ============================================================================
