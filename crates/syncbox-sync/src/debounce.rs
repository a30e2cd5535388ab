//! Delay/Dedup Processor
//!
//! Absorbs bursts of changes for the same key and emits at most one item
//! per burst once the key has been idle for the configured window.
//!
//! ## Architecture
//!
//! ```text
//!  enqueue() ──→ unbounded command channel ──→ processor task ──→ downstream mpsc
//!                                                   │
//!                                       HashMap<key, pending> + DelayQueue
//! ```
//!
//! The command channel is drained continuously, so memory grows with the
//! number of distinct pending keys rather than with the number of events.
//! Items leave in the order their idle windows expire.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace, warn};

use syncbox_core::domain::{ChangeKind, ChangeRecord, RelativePath};

// ============================================================================
// Coalescing rules
// ============================================================================

/// Result of merging a newer item into a pending one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coalesced<T> {
    /// Keep this item pending instead
    Replace(T),
    /// Both items cancel out; nothing is emitted for the key
    Cancel,
}

/// Items the processor can deduplicate
pub trait Coalesce: Sized + Send + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + 'static;

    fn key(&self) -> Self::Key;

    /// Merge `newer` into `pending`; both share the same key
    fn coalesce(pending: Self, newer: Self) -> Coalesced<Self>;

    /// Key of another pending item this one takes over (a rename's source)
    fn absorbs(&self) -> Option<Self::Key> {
        None
    }

    /// Fold the item pending under [`absorbs`](Self::absorbs) into `self`
    fn absorb(self, absorbed: Self) -> Self {
        let _ = absorbed;
        self
    }
}

impl Coalesce for ChangeRecord {
    type Key = RelativePath;

    fn key(&self) -> RelativePath {
        self.path().clone()
    }

    fn coalesce(pending: Self, newer: Self) -> Coalesced<Self> {
        match (pending.kind(), newer.kind()) {
            (ChangeKind::Create, ChangeKind::Delete) => Coalesced::Cancel,
            (ChangeKind::Create, ChangeKind::Rename) => Coalesced::Replace(newer),
            (ChangeKind::Create, _) => Coalesced::Replace(newer.with_kind(ChangeKind::Create)),
            (ChangeKind::Rename, kind) => {
                let Some(origin) = pending.previous_path().cloned() else {
                    return Coalesced::Replace(newer);
                };
                match kind {
                    ChangeKind::Delete => Coalesced::Replace(newer.deleted_at(origin)),
                    ChangeKind::Rename => Coalesced::Replace(newer),
                    _ => Coalesced::Replace(newer.renamed_from(origin)),
                }
            }
            (ChangeKind::Delete, ChangeKind::Create) => {
                Coalesced::Replace(newer.with_kind(ChangeKind::Modify))
            }
            _ => Coalesced::Replace(newer),
        }
    }

    fn absorbs(&self) -> Option<RelativePath> {
        match self.kind() {
            ChangeKind::Rename => self.previous_path().cloned(),
            _ => None,
        }
    }

    fn absorb(self, absorbed: Self) -> Self {
        match absorbed.kind() {
            // the source never reached the server: the rename is a create
            ChangeKind::Create => self.with_kind(ChangeKind::Create),
            ChangeKind::Rename => match absorbed.previous_path() {
                Some(origin) => self.renamed_from(origin.clone()),
                None => self,
            },
            _ => self,
        }
    }
}

// ============================================================================
// DelayProcessor handle
// ============================================================================

enum Command<T> {
    Enqueue(T),
    Terminate,
}

/// Handle to a running processor task
///
/// Cheap to clone; every clone feeds the same task.
pub struct DelayProcessor<T: Coalesce> {
    commands: mpsc::UnboundedSender<Command<T>>,
    terminated: Arc<AtomicBool>,
}

impl<T: Coalesce> Clone for DelayProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            terminated: Arc::clone(&self.terminated),
        }
    }
}

impl<T: Coalesce> DelayProcessor<T> {
    /// Spawns the processor task emitting into `downstream`
    ///
    /// The returned join handle completes once the processor has been
    /// terminated and every pending item has been flushed.
    pub fn spawn(idle: Duration, downstream: mpsc::Sender<T>) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(idle, rx, downstream));
        debug!(idle_ms = idle.as_millis() as u64, "Delay processor started");
        (
            Self {
                commands,
                terminated: Arc::new(AtomicBool::new(false)),
            },
            handle,
        )
    }

    /// Inserts or replaces the pending item for its key and restarts that
    /// key's idle timer
    ///
    /// Never fails. After termination the item is dropped.
    pub fn enqueue(&self, item: T) {
        if self.terminated.load(Ordering::Acquire) {
            trace!(key = ?item.key(), "Processor terminated, dropping item");
            return;
        }
        if self.commands.send(Command::Enqueue(item)).is_err() {
            trace!("Processor task gone, dropping item");
        }
    }

    /// Flushes every pending item immediately, then rejects further enqueues
    ///
    /// Idempotent and callable from any thread.
    pub fn terminate_all_processing(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Terminating delay processor");
        let _ = self.commands.send(Command::Terminate);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

// ============================================================================
// Processor task
// ============================================================================

struct Pending<T> {
    item: T,
    /// `None` once the idle window expired and the item waits for downstream
    delay_key: Option<delay_queue::Key>,
    deadline: Instant,
}

struct ProcessorState<T: Coalesce> {
    idle: Duration,
    queue: DelayQueue<T::Key>,
    pending: HashMap<T::Key, Pending<T>>,
    /// Settled keys in expiry order; each one is also in `pending`
    ready: VecDeque<T::Key>,
}

impl<T: Coalesce> ProcessorState<T> {
    fn new(idle: Duration) -> Self {
        Self {
            idle,
            queue: DelayQueue::new(),
            pending: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    fn enqueue(&mut self, mut item: T) {
        if let Some(source) = item.absorbs() {
            if source != item.key() {
                if let Some(absorbed) = self.remove(&source) {
                    trace!(source = ?source, "Absorbed pending item");
                    item = item.absorb(absorbed);
                }
            }
        }

        let key = item.key();
        match self.remove(&key) {
            Some(pending) => match T::coalesce(pending, item) {
                Coalesced::Replace(merged) => self.insert(merged),
                Coalesced::Cancel => trace!(key = ?key, "Pending item cancelled out"),
            },
            None => self.insert(item),
        }
    }

    fn insert(&mut self, item: T) {
        let key = item.key();
        // a merge may land on another pending key
        if let Some(previous) = self.remove(&key) {
            trace!(key = ?key, "Replacing item pending under merged key");
            drop(previous);
        }
        let delay_key = self.queue.insert(key.clone(), self.idle);
        let deadline = Instant::now() + self.idle;
        self.pending.insert(
            key,
            Pending {
                item,
                delay_key: Some(delay_key),
                deadline,
            },
        );
    }

    fn remove(&mut self, key: &T::Key) -> Option<T> {
        let pending = self.pending.remove(key)?;
        match pending.delay_key {
            Some(delay_key) => {
                self.queue.remove(&delay_key);
            }
            None => self.ready.retain(|k| k != key),
        }
        Some(pending.item)
    }

    /// The idle window of `key` ran out; its DelayQueue entry is already gone
    fn expire(&mut self, key: T::Key) {
        if let Some(pending) = self.pending.get_mut(&key) {
            pending.delay_key = None;
            self.ready.push_back(key);
        }
    }

    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn next_ready(&mut self) -> Option<T> {
        let key = self.ready.pop_front()?;
        self.pending.remove(&key).map(|p| p.item)
    }

    fn drain_by_deadline(&mut self) -> Vec<T> {
        let mut items: Vec<Pending<T>> = self.pending.drain().map(|(_, p)| p).collect();
        items.sort_by_key(|p| p.deadline);
        self.queue.clear();
        self.ready.clear();
        items.into_iter().map(|p| p.item).collect()
    }
}

async fn run<T: Coalesce>(
    idle: Duration,
    mut commands: mpsc::UnboundedReceiver<Command<T>>,
    downstream: mpsc::Sender<T>,
) {
    let mut state = ProcessorState::<T>::new(idle);

    // Commands keep flowing into the per-key map while downstream is full
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Enqueue(item)) => state.enqueue(item),
                Some(Command::Terminate) | None => break,
            },
            Some(expired) = state.queue.next(), if !state.queue.is_empty() => {
                state.expire(expired.into_inner());
            }
            permit = downstream.reserve(), if state.has_ready() => match permit {
                Ok(permit) => {
                    if let Some(item) = state.next_ready() {
                        trace!(key = ?item.key(), "Emitted settled item");
                        permit.send(item);
                    }
                }
                Err(_) => {
                    warn!(dropped = state.pending.len(), "Downstream closed, dropping pending items");
                    state.drain_by_deadline();
                }
            },
        }
    }

    // Items still in the command channel arrived before termination
    while let Ok(command) = commands.try_recv() {
        if let Command::Enqueue(item) = command {
            state.enqueue(item);
        }
    }

    let flushed = state.drain_by_deadline();
    debug!(count = flushed.len(), "Flushing pending items");
    for item in flushed {
        let key = item.key();
        if downstream.send(item).await.is_err() {
            warn!(key = ?key, "Downstream closed, dropping item");
        }
    }
}
