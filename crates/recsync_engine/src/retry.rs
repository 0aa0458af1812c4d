//! Bounded per-model retry bookkeeping.

use crate::config::RetryConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// What to do after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the model again after `delay`.
    Scheduled {
        /// 1-based retry number.
        attempt: u32,
        /// Backoff before the retry runs.
        delay: Duration,
    },
    /// A retry of this model is already waiting.
    AlreadyPending,
    /// The retry budget is spent.
    Exhausted {
        /// Retries made before giving up.
        attempts: u32,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct RetryState {
    attempts: u32,
    pending: bool,
}

/// Tracks retry attempts so each model has at most one pending retry and a
/// bounded number of them.
#[derive(Debug)]
pub struct RetryScheduler {
    config: RetryConfig,
    models: Mutex<HashMap<String, RetryState>>,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a failure of `model` and decides whether to retry.
    pub fn next(&self, model: &str) -> RetryDecision {
        let mut models = self.models.lock();
        let state = models.entry(model.to_string()).or_default();
        if state.pending {
            return RetryDecision::AlreadyPending;
        }
        if state.attempts >= self.config.max_retries {
            return RetryDecision::Exhausted {
                attempts: state.attempts,
            };
        }
        state.attempts += 1;
        state.pending = true;
        RetryDecision::Scheduled {
            attempt: state.attempts,
            delay: self.config.backoff(state.attempts),
        }
    }

    /// Marks the pending retry of `model` as running.
    pub fn fired(&self, model: &str) {
        if let Some(state) = self.models.lock().get_mut(model) {
            state.pending = false;
        }
    }

    /// Forgets the attempts of `model` after a successful sync.
    pub fn reset(&self, model: &str) {
        let mut models = self.models.lock();
        if models.get(model).is_some_and(|s| !s.pending) {
            models.remove(model);
        }
    }

    /// Returns the retries made so far for `model`.
    pub fn attempts(&self, model: &str) -> u32 {
        self.models.lock().get(model).map_or(0, |s| s.attempts)
    }

    /// Returns true if a retry of `model` is waiting.
    pub fn is_pending(&self, model: &str) -> bool {
        self.models.lock().get(model).is_some_and(|s| s.pending)
    }
}
