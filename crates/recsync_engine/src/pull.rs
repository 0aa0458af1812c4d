//! Pull pipeline: fetches changes made on the server since the watermark.

use crate::credential::Credential;
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::events::{SyncEvent, SyncPhase};
use crate::model::ModelSchema;
use crate::report::{PhaseOutcome, SkipReason};
use crate::store::{StoreChange, SyncStore};
use crate::transport::SyncTransport;
use recsync_protocol::{ReadRequest, ReadResponse, CLIENT_ID_COLUMN};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Translates a parsed read response into store changes.
///
/// Tombstones become [`StoreChange::DeleteRemote`], every other row a
/// [`StoreChange::UpsertRemote`] carrying the model fields of the row.
pub fn plan_pull(schema: &dyn ModelSchema, response: &ReadResponse) -> Vec<StoreChange> {
    response
        .rows
        .iter()
        .map(|row| {
            if row.is_tombstone() {
                StoreChange::DeleteRemote {
                    server_id: row.server_id(),
                }
            } else {
                StoreChange::UpsertRemote {
                    server_id: row.server_id(),
                    client_id: row
                        .get(CLIENT_ID_COLUMN)
                        .filter(|cid| !cid.is_empty())
                        .map(str::to_string),
                    fields: schema.import_row(row),
                }
            }
        })
        .collect()
}

impl<T: SyncTransport, S: SyncStore + 'static> SyncEngine<T, S> {
    /// Pulls the remote changes of one model.
    pub async fn pull(self: &Arc<Self>, model: &str) -> SyncResult<PhaseOutcome> {
        let schema = Arc::clone(self.registry.get(model)?);
        let credential = self.credential()?;
        Ok(self.pull_model(&schema, credential.as_ref()).await)
    }

    pub(crate) async fn pull_model(
        self: &Arc<Self>,
        schema: &Arc<dyn ModelSchema>,
        credential: Option<&Credential>,
    ) -> PhaseOutcome {
        let model = schema.name();
        let lease = match self.leases.try_read(model) {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(model, "read lease held elsewhere, pull skipped");
                return PhaseOutcome::Skipped(SkipReason::LeaseHeld);
            }
            Err(e) => return self.handle_failure(model, SyncPhase::Pull, e),
        };

        let result = self.pull_locked(schema, credential).await;
        if let Err(e) = lease.release() {
            warn!(model, error = %e, "failed to release read lease");
        }

        match result {
            Ok(outcome) => {
                if let PhaseOutcome::Pulled {
                    applied,
                    removed,
                    watermark,
                } = outcome
                {
                    if applied + removed > 0 {
                        info!(model, applied, removed, %watermark, "pull complete");
                    }
                    let now = self.clock.now();
                    self.record_stats(|stats| {
                        stats.records_pulled += (applied + removed) as u64;
                        stats.last_sync_time = Some(now);
                    });
                    self.emit(SyncEvent::Pulled {
                        model: model.to_string(),
                        applied,
                        removed,
                        watermark,
                    });
                }
                outcome
            }
            Err(e) => self.handle_failure(model, SyncPhase::Pull, e),
        }
    }

    async fn pull_locked(
        &self,
        schema: &Arc<dyn ModelSchema>,
        credential: Option<&Credential>,
    ) -> SyncResult<PhaseOutcome> {
        let model = schema.name();
        let last_sync = self
            .store
            .load_metadata(model)?
            .and_then(|meta| meta.last_sync);
        let request = ReadRequest {
            version: schema.version(),
            table: schema.table().to_string(),
            view: schema.view().to_string(),
            credential: credential.map(|c| c.as_str().to_string()).unwrap_or_default(),
            last_timestamp: last_sync,
        };
        debug!(model, last_sync = ?last_sync, "requesting changes");

        let response = self.transport.read(&request).await?;
        let changes = plan_pull(schema.as_ref(), &response);
        let removed = changes
            .iter()
            .filter(|c| matches!(c, StoreChange::DeleteRemote { .. }))
            .count();
        let applied = changes.len() - removed;
        self.store.apply(model, &changes)?;

        let mut advanced = false;
        let metadata = self.store.update_metadata(model, &mut |meta| {
            advanced = meta.advance_watermark(response.watermark);
        })?;
        if !advanced {
            warn!(
                model,
                stored = ?metadata.last_sync,
                received = %response.watermark,
                "server watermark is older than the stored one, keeping the stored one"
            );
        }

        Ok(PhaseOutcome::Pulled {
            applied,
            removed,
            watermark: metadata.last_sync.unwrap_or(response.watermark),
        })
    }
}
