//! Time-bounded read and write leases.
//!
//! A lease is held when its persisted expiry lies in the future. Acquiring a
//! lease is a single atomic read-modify-write of the model's metadata row, so
//! two workers can never both observe an expired lease and both take it. On
//! top of the persisted expiry the manager remembers which leases this
//! process holds: a lease is never handed out twice in-process even if the
//! wall clock runs past its expiry while the holder is still working.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::metadata::{LeaseKind, MetadataStore};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Grants and releases leases on top of a [`MetadataStore`].
pub struct LeaseManager {
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    duration: Duration,
    held: Mutex<HashSet<(String, LeaseKind)>>,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("duration", &self.duration)
            .field("held", &*self.held.lock())
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Creates a manager granting leases of `duration`.
    pub fn new(metadata: Arc<dyn MetadataStore>, clock: Arc<dyn Clock>, duration: Duration) -> Self {
        Self {
            metadata,
            clock,
            duration,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Default lease duration of this manager.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Tries to take the write lease of a model.
    pub fn acquire_write_lease(&self, model: &str, duration: Duration) -> SyncResult<bool> {
        self.acquire(model, LeaseKind::Write, duration)
    }

    /// Releases the write lease of a model.
    pub fn release_write_lease(&self, model: &str) -> SyncResult<()> {
        self.release(model, LeaseKind::Write)
    }

    /// Tries to take the read lease of a model.
    pub fn acquire_read_lease(&self, model: &str, duration: Duration) -> SyncResult<bool> {
        self.acquire(model, LeaseKind::Read, duration)
    }

    /// Releases the read lease of a model.
    pub fn release_read_lease(&self, model: &str) -> SyncResult<()> {
        self.release(model, LeaseKind::Read)
    }

    /// Returns true if this process currently holds the lease.
    pub fn is_held(&self, model: &str, kind: LeaseKind) -> bool {
        self.held.lock().contains(&(model.to_string(), kind))
    }

    /// Takes the write lease for the configured duration.
    pub fn try_write(self: &Arc<Self>, model: &str) -> SyncResult<Option<LeaseGuard>> {
        self.try_acquire(model, LeaseKind::Write)
    }

    /// Takes the read lease for the configured duration.
    pub fn try_read(self: &Arc<Self>, model: &str) -> SyncResult<Option<LeaseGuard>> {
        self.try_acquire(model, LeaseKind::Read)
    }

    /// Takes a lease and wraps it in a guard that releases it on drop.
    /// Returns `None` if the lease is held elsewhere.
    pub fn try_acquire(
        self: &Arc<Self>,
        model: &str,
        kind: LeaseKind,
    ) -> SyncResult<Option<LeaseGuard>> {
        if !self.acquire(model, kind, self.duration)? {
            return Ok(None);
        }
        Ok(Some(LeaseGuard {
            manager: Arc::clone(self),
            model: model.to_string(),
            kind,
            released: false,
        }))
    }

    fn acquire(&self, model: &str, kind: LeaseKind, duration: Duration) -> SyncResult<bool> {
        let duration = chrono::Duration::from_std(duration)
            .map_err(|e| SyncError::Config(format!("lease duration out of range: {e}")))?;
        let key = (model.to_string(), kind);

        let mut held = self.held.lock();
        if held.contains(&key) {
            debug!(model, ?kind, "lease already held by this process");
            return Ok(false);
        }

        let now = self.clock.now();
        let mut granted = false;
        self.metadata.update_metadata(model, &mut |meta| {
            granted = meta.lease_available(kind, now);
            if granted {
                meta.set_lease_expiry(kind, Some(now + duration));
            }
        })?;

        if granted {
            held.insert(key);
            debug!(model, ?kind, "lease acquired");
        } else {
            debug!(model, ?kind, "lease refused");
        }
        Ok(granted)
    }

    fn release(&self, model: &str, kind: LeaseKind) -> SyncResult<()> {
        let mut held = self.held.lock();
        self.metadata.update_metadata(model, &mut |meta| {
            meta.set_lease_expiry(kind, None);
        })?;
        held.remove(&(model.to_string(), kind));
        debug!(model, ?kind, "lease released");
        Ok(())
    }
}

/// A held lease. Released when dropped.
#[derive(Debug)]
pub struct LeaseGuard {
    manager: Arc<LeaseManager>,
    model: String,
    kind: LeaseKind,
    released: bool,
}

impl LeaseGuard {
    /// Model the lease belongs to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Kind of the lease.
    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    /// Releases the lease now, reporting storage failures.
    pub fn release(mut self) -> SyncResult<()> {
        self.released = true;
        self.manager.release(&self.model, self.kind)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.model, self.kind) {
            warn!(model = %self.model, kind = ?self.kind, error = %e, "failed to release lease");
        }
    }
}
