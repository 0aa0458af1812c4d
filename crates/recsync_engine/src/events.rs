//! Sync notifications and counters.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// The two phases of a model sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// Sending local changes.
    Push,
    /// Fetching remote changes.
    Pull,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Push => f.write_str("push"),
            SyncPhase::Pull => f.write_str("pull"),
        }
    }
}

/// An event broadcast to [`SyncEngine::subscribe`](crate::SyncEngine::subscribe) receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A push completed.
    Pushed {
        /// Model name.
        model: String,
        /// Records created or updated on the server.
        written: usize,
        /// Records deleted on the server.
        deleted: usize,
    },
    /// A pull completed.
    Pulled {
        /// Model name.
        model: String,
        /// Rows inserted or updated locally.
        applied: usize,
        /// Records removed by tombstones.
        removed: usize,
        /// New watermark.
        watermark: DateTime<Utc>,
    },
    /// A phase failed.
    Failed {
        /// Model name.
        model: String,
        /// Phase that failed.
        phase: SyncPhase,
        /// Error message.
        error: String,
        /// Whether the failure is transient.
        retryable: bool,
    },
    /// A retry of the model was scheduled.
    RetryScheduled {
        /// Model name.
        model: String,
        /// 1-based retry number.
        attempt: u32,
        /// Backoff before it runs.
        delay: Duration,
    },
    /// The model failed too often and will not be retried.
    RetryAbandoned {
        /// Model name.
        model: String,
        /// Retries made.
        attempts: u32,
    },
    /// The server rejected the credential.
    ReauthenticationRequired {
        /// Model name.
        model: String,
    },
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Orchestrator runs completed.
    pub cycles_completed: u64,
    /// Records created or updated on the server.
    pub records_pushed: u64,
    /// Records deleted on the server.
    pub records_deleted: u64,
    /// Rows applied from pulls.
    pub records_pulled: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Phases that failed.
    pub failures: u64,
    /// Time of the last successful pull.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}
