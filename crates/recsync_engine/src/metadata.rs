//! Per-model sync metadata: watermark and lease expiries.

use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The two leases a model can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeaseKind {
    /// Held by a pull.
    Read,
    /// Held by a push.
    Write,
}

/// Sync bookkeeping for one model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Model name.
    pub model: String,
    /// Server watermark of the last fully applied pull, `None` when never synced.
    pub last_sync: Option<DateTime<Utc>>,
    /// Expiry of the read lease, `None` when released.
    pub read_lease_expiry: Option<DateTime<Utc>>,
    /// Expiry of the write lease, `None` when released.
    pub write_lease_expiry: Option<DateTime<Utc>>,
}

impl SyncMetadata {
    /// Creates metadata for a model that was never synced.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            last_sync: None,
            read_lease_expiry: None,
            write_lease_expiry: None,
        }
    }

    /// Returns the expiry of a lease.
    pub fn lease_expiry(&self, kind: LeaseKind) -> Option<DateTime<Utc>> {
        match kind {
            LeaseKind::Read => self.read_lease_expiry,
            LeaseKind::Write => self.write_lease_expiry,
        }
    }

    /// Sets the expiry of a lease.
    pub fn set_lease_expiry(&mut self, kind: LeaseKind, expiry: Option<DateTime<Utc>>) {
        match kind {
            LeaseKind::Read => self.read_lease_expiry = expiry,
            LeaseKind::Write => self.write_lease_expiry = expiry,
        }
    }

    /// Returns true if the lease has expired or was released.
    pub fn lease_available(&self, kind: LeaseKind, now: DateTime<Utc>) -> bool {
        self.lease_expiry(kind).map_or(true, |expiry| now >= expiry)
    }

    /// Moves the watermark forward. Returns false if `watermark` is older
    /// than the stored one, in which case nothing changes.
    pub fn advance_watermark(&mut self, watermark: DateTime<Utc>) -> bool {
        match self.last_sync {
            Some(current) if watermark < current => false,
            _ => {
                self.last_sync = Some(watermark);
                true
            }
        }
    }

    /// Returns true if the last pull is younger than `window`.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Some(last_sync) = self.last_sync else {
            return false;
        };
        match chrono::Duration::from_std(window) {
            Ok(window) => now.signed_duration_since(last_sync) < window,
            Err(_) => true,
        }
    }
}

/// Persistent table of [`SyncMetadata`], one row per model.
pub trait MetadataStore: Send + Sync {
    /// Loads the metadata of a model.
    fn load_metadata(&self, model: &str) -> SyncResult<Option<SyncMetadata>>;

    /// Lists the metadata of every model.
    fn list_metadata(&self) -> SyncResult<Vec<SyncMetadata>>;

    /// Reads, modifies and writes the metadata of a model as one atomic step,
    /// creating the row if it does not exist. Returns the stored value.
    fn update_metadata(
        &self,
        model: &str,
        update: &mut dyn FnMut(&mut SyncMetadata),
    ) -> SyncResult<SyncMetadata>;

    /// Creates the row of a model if absent. Returns true if it was created.
    fn ensure_metadata(&self, model: &str) -> SyncResult<bool> {
        if self.load_metadata(model)?.is_some() {
            return Ok(false);
        }
        self.update_metadata(model, &mut |_| {})?;
        Ok(true)
    }
}
