//! Per-syncbox shared state
//!
//! [`SyncboxContext`] is created once per syncbox and shared (behind an
//! `Arc`) by the engine, the daemon and administrative callers. It owns the
//! active-sync reservation and the single transfer scheduler.

use std::sync::{Arc, OnceLock};

use syncbox_core::domain::{ActiveSyncReservation, ReservationOwner, SyncError, SyncboxId};
use tracing::{debug, info};

use crate::transfer::TransferScheduler;

#[derive(Debug)]
pub struct SyncboxContext {
    syncbox_id: SyncboxId,
    reservation: ActiveSyncReservation,
    scheduler: OnceLock<Arc<TransferScheduler>>,
}

impl SyncboxContext {
    pub fn new(syncbox_id: SyncboxId) -> Self {
        Self {
            syncbox_id,
            reservation: ActiveSyncReservation::new(),
            scheduler: OnceLock::new(),
        }
    }

    pub fn syncbox_id(&self) -> SyncboxId {
        self.syncbox_id
    }

    pub fn reservation(&self) -> &ActiveSyncReservation {
        &self.reservation
    }

    /// Take the active-sync reservation
    ///
    /// # Errors
    /// `SyncError::Reservation` naming the current holder
    pub fn try_reserve(&self, owner: ReservationOwner) -> Result<(), SyncError> {
        self.reservation.try_reserve(owner.clone())?;
        debug!(syncbox = %self.syncbox_id, owner = %owner, "Syncbox reserved");
        Ok(())
    }

    /// Release the reservation (ResetReserveForActiveSync)
    pub fn reset_reservation(&self) {
        if let Some(owner) = self.reservation.reset() {
            debug!(syncbox = %self.syncbox_id, owner = %owner, "Syncbox reservation released");
        }
    }

    /// Install the shared transfer scheduler
    ///
    /// # Errors
    /// `SyncError::Validation` if a scheduler was already configured
    pub fn configure_scheduler(
        &self,
        scheduler: Arc<TransferScheduler>,
    ) -> Result<Arc<TransferScheduler>, SyncError> {
        self.scheduler.set(Arc::clone(&scheduler)).map_err(|_| {
            SyncError::Validation(format!(
                "transfer scheduler for syncbox {} is already configured",
                self.syncbox_id
            ))
        })?;
        info!(syncbox = %self.syncbox_id, "Transfer scheduler configured");
        Ok(scheduler)
    }

    pub fn scheduler(&self) -> Option<Arc<TransferScheduler>> {
        self.scheduler.get().cloned()
    }

    /// Dispose the scheduler, if one was configured
    pub async fn dispose_schedulers(&self) {
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.dispose_both().await;
        }
    }
}
