//! Active-sync reservation
//!
//! A syncbox may have at most one Sync Engine running, and administrative
//! operations (quota changes, syncbox deletion) must not overlap with it.
//! [`ActiveSyncReservation`] is the exclusive flag enforcing that: a
//! mutex-guarded owner slot checked and set atomically.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::errors::SyncError;

/// Who holds the reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOwner {
    /// A running sync engine
    SyncEngine,
    /// An administrative modification, described by name
    Administrative(String),
}

impl fmt::Display for ReservationOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyncEngine => write!(f, "sync engine"),
            Self::Administrative(op) => write!(f, "{op}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Holder {
    owner: ReservationOwner,
    since: DateTime<Utc>,
}

/// Exclusive per-syncbox flag
///
/// `try_reserve` never blocks waiting for the holder; a second caller fails
/// fast with [`SyncError::Reservation`].
#[derive(Debug, Default)]
pub struct ActiveSyncReservation {
    holder: Mutex<Option<Holder>>,
}

impl ActiveSyncReservation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the reservation for `owner`
    ///
    /// # Errors
    /// Returns `SyncError::Reservation` naming the current holder when the
    /// reservation is already taken.
    pub fn try_reserve(&self, owner: ReservationOwner) -> Result<(), SyncError> {
        let mut holder = self.lock();
        if let Some(current) = holder.as_ref() {
            return Err(SyncError::Reservation {
                holder: format!("{} since {}", current.owner, current.since.to_rfc3339()),
            });
        }
        tracing::debug!(owner = %owner, "Active-sync reservation taken");
        *holder = Some(Holder {
            owner,
            since: Utc::now(),
        });
        Ok(())
    }

    /// Release the reservation regardless of who holds it
    ///
    /// Returns the previous owner, if any.
    pub fn reset(&self) -> Option<ReservationOwner> {
        let previous = self.lock().take().map(|h| h.owner);
        if let Some(owner) = &previous {
            tracing::debug!(owner = %owner, "Active-sync reservation released");
        }
        previous
    }

    /// Current owner, if reserved
    #[must_use]
    pub fn holder(&self) -> Option<ReservationOwner> {
        self.lock().as_ref().map(|h| h.owner.clone())
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Holder>> {
        // an Option cannot be left half-written by a panicking holder
        self.holder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
