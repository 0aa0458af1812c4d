//! Freshness-gated reads.
//!
//! A query always answers from the local store at once. When the model's
//! last pull is older than the caller's freshness window, a pull runs in the
//! background and the caller hears back once through its [`QueryListener`]:
//! either with the refreshed records, or, if the pull is still running when
//! the fallback delay elapses and there was something to show, with the
//! local records marked as not reachable.

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncPhase;
use crate::model::{ModelSchema, Record};
use crate::report::PhaseOutcome;
use crate::store::{Query, SyncStore};
use crate::transport::SyncTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Error text delivered when the server did not answer within the fallback delay.
pub const NOT_REACHABLE: &str = "not reachable";

/// Error text delivered when another pull held the read lease and no read was sent.
pub const REFRESH_SKIPPED: &str = "refresh skipped: lease held";

/// An asynchronous follow-up to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BelatedResponse {
    /// Model that was queried.
    pub model: String,
    /// The query re-run against the local store.
    pub records: Vec<Record>,
    /// Why the records may be stale, `None` after a successful refresh.
    pub error: Option<String>,
}

/// Receives the follow-up of a stale query.
pub trait QueryListener: Send + Sync {
    /// Called at most once per query.
    fn belated_response(&self, response: BelatedResponse);
}

impl<F> QueryListener for F
where
    F: Fn(BelatedResponse) + Send + Sync,
{
    fn belated_response(&self, response: BelatedResponse) {
        self(response)
    }
}

/// Answer of [`SyncEngine::query`].
#[derive(Debug)]
pub struct QueryResult {
    /// Records served from the local store.
    pub records: Vec<Record>,
    /// Set when a refresh was started and a follow-up will be delivered.
    pub pending: Option<PendingRefresh>,
}

/// Handle on a scheduled follow-up notification.
#[derive(Debug)]
pub struct PendingRefresh {
    cancelled: Arc<AtomicBool>,
    notifier: JoinHandle<()>,
}

impl PendingRefresh {
    /// Suppresses the follow-up. The background pull keeps running.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notifier.abort();
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits until the follow-up was delivered or suppressed.
    pub async fn finished(self) {
        if let Err(e) = self.notifier.await {
            if !e.is_cancelled() {
                warn!(error = %e, "query notifier failed");
            }
        }
    }
}

impl<T: SyncTransport, S: SyncStore + 'static> SyncEngine<T, S> {
    /// Queries local records, refreshing them in the background when stale.
    ///
    /// Must be called inside a tokio runtime when a refresh may be needed.
    pub fn query(
        self: &Arc<Self>,
        model: &str,
        query: Query,
        freshness: Duration,
        listener: Arc<dyn QueryListener>,
    ) -> SyncResult<QueryResult> {
        let schema = Arc::clone(self.registry.get(model)?);
        let records = self.store.query(model, &query)?;

        let now = self.clock.now();
        let fresh = self
            .store
            .load_metadata(model)?
            .is_some_and(|meta| meta.is_fresh(now, freshness));
        if fresh {
            return Ok(QueryResult {
                records,
                pending: None,
            });
        }

        let handle = Handle::try_current()
            .map_err(|_| SyncError::Config("refreshing a query needs a tokio runtime".into()))?;
        debug!(model, "cached data is stale, refreshing");

        let engine = Arc::clone(self);
        let pull = handle.spawn(async move { engine.refresh(&schema).await });

        let fallback = (!records.is_empty()).then_some(self.config.fallback_delay);
        let cancelled = Arc::new(AtomicBool::new(false));
        let notifier = handle.spawn(Arc::clone(self).notify_refreshed(
            model.to_string(),
            query,
            pull,
            fallback,
            listener,
            Arc::clone(&cancelled),
        ));

        Ok(QueryResult {
            records,
            pending: Some(PendingRefresh {
                cancelled,
                notifier,
            }),
        })
    }

    /// Queries with the configured default freshness window.
    pub fn query_default(
        self: &Arc<Self>,
        model: &str,
        query: Query,
        listener: Arc<dyn QueryListener>,
    ) -> SyncResult<QueryResult> {
        self.query(model, query, self.config.default_freshness, listener)
    }

    async fn refresh(self: &Arc<Self>, schema: &Arc<dyn ModelSchema>) -> PhaseOutcome {
        match self.credential() {
            Ok(credential) => self.pull_model(schema, credential.as_ref()).await,
            Err(e) => self.handle_failure(schema.name(), SyncPhase::Pull, e),
        }
    }

    async fn notify_refreshed(
        self: Arc<Self>,
        model: String,
        query: Query,
        pull: JoinHandle<PhaseOutcome>,
        fallback: Option<Duration>,
        listener: Arc<dyn QueryListener>,
        cancelled: Arc<AtomicBool>,
    ) {
        let joined = match fallback {
            Some(delay) => {
                tokio::select! {
                    joined = pull => joined,
                    () = tokio::time::sleep(delay) => {
                        debug!(model = %model, "refresh too slow, delivering cached records");
                        if !cancelled.load(Ordering::SeqCst) {
                            listener.belated_response(
                                self.belated(model, &query, Some(NOT_REACHABLE.to_string())),
                            );
                        }
                        return;
                    }
                }
            }
            None => pull.await,
        };

        let error = match joined {
            Ok(PhaseOutcome::Failed { error, .. }) => Some(error.to_string()),
            Ok(PhaseOutcome::Skipped(reason)) => {
                debug!(model = %model, ?reason, "refresh did not run");
                Some(REFRESH_SKIPPED.to_string())
            }
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };
        if !cancelled.load(Ordering::SeqCst) {
            listener.belated_response(self.belated(model, &query, error));
        }
    }

    fn belated(&self, model: String, query: &Query, error: Option<String>) -> BelatedResponse {
        match self.store.query(&model, query) {
            Ok(records) => BelatedResponse {
                model,
                records,
                error,
            },
            Err(e) => BelatedResponse {
                model,
                records: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }
}
