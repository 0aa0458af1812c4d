//! The sync orchestrator.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::credential::{Anonymous, Credential, CredentialProvider};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncPhase, SyncStats};
use crate::lease::LeaseManager;
use crate::metadata::SyncMetadata;
use crate::model::{ModelRegistry, ModelSchema, Record};
use crate::report::{ModelReport, PhaseOutcome, SyncReport};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::{StoreChange, SyncStore};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use recsync_protocol::{CLIENT_ID_COLUMN, DELETE_COLUMN, ID_COLUMN};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// The sync engine.
///
/// Built once per process with [`SyncEngine::builder`] and shared as an
/// `Arc`. Every entry point that can start background work (retries,
/// query refreshes) takes `self: &Arc<Self>`.
pub struct SyncEngine<T: SyncTransport, S: SyncStore + 'static> {
    pub(crate) config: SyncConfig,
    pub(crate) registry: ModelRegistry,
    pub(crate) transport: T,
    pub(crate) store: Arc<S>,
    credentials: Arc<dyn CredentialProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) leases: Arc<LeaseManager>,
    retries: RetryScheduler,
    events: broadcast::Sender<SyncEvent>,
    stats: RwLock<SyncStats>,
}

impl<T: SyncTransport, S: SyncStore + 'static> std::fmt::Debug for SyncEngine<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("models", &self.registry.names())
            .finish_non_exhaustive()
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder<T: SyncTransport, S: SyncStore + 'static> {
    config: SyncConfig,
    registry: ModelRegistry,
    transport: T,
    store: Arc<S>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
}

impl<T: SyncTransport, S: SyncStore + 'static> SyncEngineBuilder<T, S> {
    /// Sets the configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a model.
    pub fn model(mut self, schema: impl ModelSchema + 'static) -> Self {
        self.registry.register(schema);
        self
    }

    /// Replaces the model registry.
    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the credential provider. Without one every sync is anonymous.
    pub fn credentials(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.credentials = Arc::new(provider);
        self
    }

    /// Sets a shared credential provider.
    pub fn credentials_arc(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = provider;
        self
    }

    /// Sets the clock used for leases and freshness.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Arc<SyncEngine<T, S>> {
        let metadata: Arc<dyn crate::metadata::MetadataStore> = self.store.clone();
        let leases = Arc::new(LeaseManager::new(
            metadata,
            Arc::clone(&self.clock),
            self.config.lease_duration,
        ));
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        Arc::new(SyncEngine {
            retries: RetryScheduler::new(self.config.retry.clone()),
            config: self.config,
            registry: self.registry,
            transport: self.transport,
            store: self.store,
            credentials: self.credentials,
            clock: self.clock,
            leases,
            events,
            stats: RwLock::new(SyncStats::default()),
        })
    }
}

impl<T: SyncTransport, S: SyncStore + 'static> SyncEngine<T, S> {
    /// Starts building an engine over a transport and a store.
    pub fn builder(transport: T, store: Arc<S>) -> SyncEngineBuilder<T, S> {
        SyncEngineBuilder {
            config: SyncConfig::default(),
            registry: ModelRegistry::new(),
            transport,
            store,
            credentials: Arc::new(Anonymous),
            clock: Arc::new(SystemClock),
        }
    }

    /// Creates the metadata row of every registered model that lacks one.
    pub fn configure(&self) -> SyncResult<()> {
        for name in self.registry.names() {
            if self.store.ensure_metadata(&name)? {
                debug!(model = %name, "created sync metadata");
            }
        }
        info!(models = self.registry.len(), "sync engine configured");
        Ok(())
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the model registry.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Returns the record store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the lease manager.
    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// Returns the sync metadata of a model.
    pub fn metadata(&self, model: &str) -> SyncResult<SyncMetadata> {
        self.registry.get(model)?;
        Ok(self
            .store
            .load_metadata(model)?
            .unwrap_or_else(|| SyncMetadata::new(model)))
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Returns true if a retry of the model is waiting.
    pub fn retry_pending(&self, model: &str) -> bool {
        self.retries.is_pending(model)
    }

    /// Syncs the given models: push then pull for each, in order.
    pub async fn sync(self: &Arc<Self>, models: &[&str]) -> SyncResult<SyncReport> {
        let start = Instant::now();
        let schemas = models
            .iter()
            .map(|name| self.registry.get(name).cloned())
            .collect::<SyncResult<Vec<_>>>()?;
        let credential = self.credential()?;
        if credential.is_none() {
            info!("no credential available, local changes stay unsent");
        }

        let mut report = SyncReport::default();
        for schema in &schemas {
            report
                .models
                .push(self.run_model(schema, credential.as_ref()).await);
        }
        report.duration = start.elapsed();

        self.stats.write().cycles_completed += 1;
        info!(
            models = report.models.len(),
            success = report.is_success(),
            duration_ms = report.duration.as_millis() as u64,
            "sync finished"
        );
        Ok(report)
    }

    /// Syncs every registered model.
    pub async fn sync_all(self: &Arc<Self>) -> SyncResult<SyncReport> {
        let names = self.registry.names();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.sync(&names).await
    }

    /// Syncs a single model: push, then pull.
    pub async fn sync_model(self: &Arc<Self>, model: &str) -> SyncResult<ModelReport> {
        let schema = Arc::clone(self.registry.get(model)?);
        let credential = self.credential()?;
        Ok(self.run_model(&schema, credential.as_ref()).await)
    }

    async fn run_model(
        self: &Arc<Self>,
        schema: &Arc<dyn ModelSchema>,
        credential: Option<&Credential>,
    ) -> ModelReport {
        let push = self.push_model(schema, credential).await;
        let pull = self.pull_model(schema, credential).await;
        let report = ModelReport {
            model: schema.name().to_string(),
            push,
            pull,
        };
        if report.is_ok() {
            self.retries.reset(schema.name());
        }
        report
    }

    /// Creates a local record. It is sent on the next push.
    pub fn create(&self, model: &str, fields: BTreeMap<String, String>) -> SyncResult<Record> {
        self.writable(model, &fields)?;
        let record = Record::new_local(fields);
        self.store
            .apply(model, &[StoreChange::Insert(record.clone())])?;
        debug!(model, client_id = %record.client_id, "record created");
        Ok(record)
    }

    /// Overwrites fields of a local record.
    pub fn update(
        &self,
        model: &str,
        client_id: &str,
        fields: BTreeMap<String, String>,
    ) -> SyncResult<Record> {
        self.writable(model, &fields)?;
        self.store.apply(
            model,
            &[StoreChange::Update {
                client_id: client_id.to_string(),
                fields,
            }],
        )?;
        self.store
            .get(model, client_id)?
            .ok_or_else(|| SyncError::RecordNotFound {
                model: model.to_string(),
                client_id: client_id.to_string(),
            })
    }

    /// Deletes a local record. Records never pushed are removed at once.
    pub fn delete(&self, model: &str, client_id: &str) -> SyncResult<()> {
        self.writable(model, &BTreeMap::new())?;
        self.store.apply(
            model,
            &[StoreChange::MarkDeleted {
                client_id: client_id.to_string(),
            }],
        )?;
        debug!(model, client_id, "record deleted");
        Ok(())
    }

    fn writable(&self, model: &str, fields: &BTreeMap<String, String>) -> SyncResult<()> {
        let schema = self.registry.get(model)?;
        if schema.read_only() {
            return Err(SyncError::InvalidWrite(format!("model {model} is read-only")));
        }
        if let Some(column) = fields
            .keys()
            .find(|k| matches!(k.as_str(), ID_COLUMN | CLIENT_ID_COLUMN | DELETE_COLUMN))
        {
            return Err(SyncError::InvalidWrite(format!(
                "column {column:?} is managed by the engine"
            )));
        }
        Ok(())
    }

    pub(crate) fn credential(&self) -> SyncResult<Option<Credential>> {
        self.credentials.credential()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn record_stats(&self, update: impl FnOnce(&mut SyncStats)) {
        update(&mut *self.stats.write());
    }

    /// Logs a failed phase, reports it and schedules a retry if it is transient.
    pub(crate) fn handle_failure(
        self: &Arc<Self>,
        model: &str,
        phase: SyncPhase,
        error: SyncError,
    ) -> PhaseOutcome {
        let retryable = error.is_retryable();
        match &error {
            SyncError::Protocol(e) => {
                error!(model, %phase, error = %e, "malformed server response");
            }
            SyncError::Unauthorized(_) => {
                warn!(model, %phase, error = %error, "credential rejected");
            }
            _ if retryable => warn!(model, %phase, error = %error, "sync phase failed"),
            _ => error!(model, %phase, error = %error, "sync phase failed"),
        }

        self.record_stats(|stats| {
            stats.failures += 1;
            stats.last_error = Some(error.to_string());
        });
        self.emit(SyncEvent::Failed {
            model: model.to_string(),
            phase,
            error: error.to_string(),
            retryable,
        });

        let retry_scheduled = if error.needs_reauthentication() {
            self.emit(SyncEvent::ReauthenticationRequired {
                model: model.to_string(),
            });
            false
        } else if retryable {
            self.schedule_retry(model)
        } else {
            false
        };

        PhaseOutcome::Failed {
            error,
            retry_scheduled,
        }
    }

    fn schedule_retry(self: &Arc<Self>, model: &str) -> bool {
        match self.retries.next(model) {
            RetryDecision::Scheduled { attempt, delay } => {
                let Ok(handle) = Handle::try_current() else {
                    warn!(model, "no async runtime, retry not scheduled");
                    self.retries.fired(model);
                    return false;
                };
                info!(model, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
                self.record_stats(|stats| stats.retries += 1);
                self.emit(SyncEvent::RetryScheduled {
                    model: model.to_string(),
                    attempt,
                    delay,
                });
                handle.spawn(Arc::clone(self).retry_after(model.to_string(), delay));
                true
            }
            RetryDecision::AlreadyPending => {
                debug!(model, "retry already pending");
                true
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(model, attempts, "giving up on retries");
                self.emit(SyncEvent::RetryAbandoned {
                    model: model.to_string(),
                    attempts,
                });
                false
            }
        }
    }

    fn retry_after(
        self: Arc<Self>,
        model: String,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            self.retries.fired(&model);
            match self.sync_model(&model).await {
                Ok(report) => debug!(model = %model, ok = report.is_ok(), "retry finished"),
                Err(e) => warn!(model = %model, error = %e, "retry could not start"),
            }
        })
    }
}
