//! Domain entities and business logic
//!
//! This module contains the core domain types of the sync core:
//! - Newtypes for identifiers, counters and validated paths
//! - Change records and their id generator
//! - Index entries (last-known-synchronized state per path)
//! - Remote change descriptions
//! - The pure reconciliation diff and conflict policy
//! - The active-sync reservation
//! - The error taxonomy and error aggregation

pub mod change;
pub mod conflict;
pub mod credentials;
pub mod diff;
pub mod errors;
pub mod index_entry;
pub mod newtypes;
pub mod remote;
pub mod reservation;

// Re-export commonly used types
pub use change::{ChangeIdGenerator, ChangeKind, ChangeRecord, ChangeRecordBuilder, Direction};
pub use conflict::{ConflictDecision, ConflictReport, ConflictSide, VersionMarker};
pub use credentials::{Credentials, SessionToken};
pub use diff::{compute_diff, DiffResult, LocalAction, RemoteAction};
pub use errors::{DomainError, ErrorList, SyncError, TransferError};
pub use index_entry::IndexEntry;
pub use newtypes::*;
pub use remote::{RemoteChange, RemoteChangeSet, RemoteItem};
pub use reservation::{ActiveSyncReservation, ReservationOwner};
