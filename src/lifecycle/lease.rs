//! Residency table and model leases

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Phase {
    /// Slot reserved, load not finished
    Loading,
    Loaded,
    /// Unload in progress; still occupies its slot
    Unloading,
}

#[derive(Debug, Clone)]
pub(super) struct Resident {
    pub phase: Phase,
    pub last_used: Instant,
    /// Outstanding leases plus callers waiting on the load
    pub in_use: usize,
    pub priority_weight: u32,
    /// Set once loaded
    pub device: Option<Device>,
}

/// Which models occupy pool slots. Guarded by the process-wide lock that
/// serializes eviction decisions; never held across an `.await`.
#[derive(Debug, Default)]
pub(super) struct Residency {
    pub table: Mutex<HashMap<String, Resident>>,
}

impl Residency {
    fn release(&self, name: &str) {
        let mut table = self.table.lock();
        if let Some(resident) = table.get_mut(name) {
            resident.in_use = resident.in_use.saturating_sub(1);
            resident.last_used = Instant::now();
        }
    }

    fn abandon_load(&self, name: &str) {
        let mut table = self.table.lock();
        if let Some(resident) = table.get_mut(name) {
            resident.in_use = resident.in_use.saturating_sub(1);
            if resident.in_use == 0 && resident.phase == Phase::Loading {
                table.remove(name);
            }
        }
    }

    /// Move an idle, loaded model to `Unloading`. Returns false if it is
    /// leased or not loaded.
    pub fn begin_unload(table: &mut HashMap<String, Resident>, name: &str) -> bool {
        match table.get_mut(name) {
            Some(resident) if resident.phase == Phase::Loaded && resident.in_use == 0 => {
                resident.phase = Phase::Unloading;
                true
            }
            _ => false,
        }
    }

    /// Free the slot of a model whose unload has returned
    pub fn finish_unload(&self, name: &str) {
        let mut table = self.table.lock();
        if table
            .get(name)
            .is_some_and(|resident| resident.phase == Phase::Unloading)
        {
            table.remove(name);
        }
    }

    pub fn mark_loaded(&self, name: &str, device: Device) {
        if let Some(resident) = self.table.lock().get_mut(name) {
            resident.phase = Phase::Loaded;
            resident.device = Some(device);
            resident.last_used = Instant::now();
        }
    }
}

/// One unit of `in_use` on a residency entry, returned on drop.
///
/// Must never be dropped while the residency lock is held.
pub(super) struct Claim {
    residency: Arc<Residency>,
    name: String,
    armed: bool,
}

impl Claim {
    pub fn new(residency: Arc<Residency>, name: &str) -> Self {
        Self {
            residency,
            name: name.to_string(),
            armed: true,
        }
    }

    /// Give the claim back after a failed load, freeing the slot if nobody
    /// else is waiting on it
    pub fn abandon_load(mut self) {
        self.armed = false;
        self.residency.abandon_load(&self.name);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.armed {
            self.residency.release(&self.name);
        }
    }
}

/// A resident model checked out by a caller.
///
/// While any lease on a model is alive the model cannot be evicted, reaped
/// or manually unloaded. Dropping the lease refreshes the model's
/// `last_used` time.
pub struct ModelLease<H> {
    name: String,
    handle: Arc<H>,
    _claim: Claim,
}

impl<H> ModelLease<H> {
    pub(super) fn new(name: &str, handle: Arc<H>, claim: Claim) -> Self {
        Self {
            name: name.to_string(),
            handle,
            _claim: claim,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }
}

impl<H> Deref for ModelLease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H> std::fmt::Debug for ModelLease<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
