//! Outcomes of a sync run.

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Why a phase did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker holds the lease.
    LeaseHeld,
    /// The model is pull-only.
    ReadOnly,
    /// No credential is available, so nothing may be written.
    Anonymous,
}

/// Result of one push or pull.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// The phase did not run.
    Skipped(SkipReason),
    /// The push completed.
    Pushed {
        /// Records created or updated on the server.
        written: usize,
        /// Records deleted on the server.
        deleted: usize,
        /// Records deleted before ever reaching the server, removed locally.
        purged: usize,
    },
    /// The pull completed.
    Pulled {
        /// Rows inserted or updated locally.
        applied: usize,
        /// Records removed by tombstones.
        removed: usize,
        /// Watermark stored after the pull.
        watermark: DateTime<Utc>,
    },
    /// The phase failed.
    Failed {
        /// The error.
        error: SyncError,
        /// Whether a retry of the model was scheduled.
        retry_scheduled: bool,
    },
}

impl PhaseOutcome {
    /// Returns true unless the phase failed.
    pub fn is_ok(&self) -> bool {
        !matches!(self, PhaseOutcome::Failed { .. })
    }

    /// Returns the error of a failed phase.
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            PhaseOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Push and pull outcome of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReport {
    /// Model name.
    pub model: String,
    /// Push outcome.
    pub push: PhaseOutcome,
    /// Pull outcome.
    pub pull: PhaseOutcome,
}

impl ModelReport {
    /// Returns true if neither phase failed.
    pub fn is_ok(&self) -> bool {
        self.push.is_ok() && self.pull.is_ok()
    }
}

/// Result of an orchestrator run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncReport {
    /// Per-model outcomes in the order the models were synced.
    pub models: Vec<ModelReport>,
    /// Wall time of the run.
    pub duration: Duration,
}

impl SyncReport {
    /// Returns true if no phase failed.
    pub fn is_success(&self) -> bool {
        self.models.iter().all(ModelReport::is_ok)
    }

    /// Returns the report of one model.
    pub fn model(&self, name: &str) -> Option<&ModelReport> {
        self.models.iter().find(|m| m.model == name)
    }
}
