//! Push pipeline: sends locally dirty records to the server.

use crate::credential::Credential;
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::events::{SyncEvent, SyncPhase};
use crate::model::{ModelSchema, Record, SyncStatus};
use crate::report::{PhaseOutcome, SkipReason};
use crate::store::{Filter, Query, StoreChange, SyncStore};
use crate::transport::SyncTransport;
use recsync_protocol::{BatchRequest, WriteResponse};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dirty records of one model, split by what the server has to do with them.
#[derive(Debug, Default)]
struct PushPlan {
    writes: Vec<Record>,
    deletes: Vec<Record>,
    local_only: Vec<Record>,
}

impl PushPlan {
    fn from_records(records: Vec<Record>) -> Self {
        let mut plan = Self::default();
        for record in records {
            match (record.sync_status, record.id) {
                (SyncStatus::Created | SyncStatus::Updated, _) => plan.writes.push(record),
                (SyncStatus::Deleted, Some(_)) => plan.deletes.push(record),
                (SyncStatus::Deleted, None) => plan.local_only.push(record),
                (SyncStatus::Current, _) => {}
            }
        }
        plan
    }
}

/// Turns a create/update response into store changes.
///
/// Each acknowledgement is matched to a sent record by client id first, then
/// by server id for records that already had one. The store resolves the
/// local record in the same order. Unmatched lines are skipped.
pub(crate) fn acknowledgements(
    model: &str,
    sent: &[Record],
    response: &WriteResponse,
) -> Vec<StoreChange> {
    let by_client: HashMap<&str, &Record> =
        sent.iter().map(|r| (r.client_id.as_str(), r)).collect();
    let by_server: HashMap<i64, &Record> = sent
        .iter()
        .filter_map(|r| r.id.map(|id| (id, r)))
        .collect();

    response
        .acks
        .iter()
        .filter_map(|ack| {
            let record = by_client
                .get(ack.client_id.as_str())
                .or_else(|| by_server.get(&ack.server_id));
            match record {
                Some(record) => Some(StoreChange::Acknowledge {
                    client_id: record.client_id.clone(),
                    server_id: ack.server_id,
                    sent: record.fields.clone(),
                }),
                None => {
                    warn!(model, server_id = ack.server_id, client_id = %ack.client_id, "acknowledgement matches no sent record");
                    None
                }
            }
        })
        .collect()
}

impl<T: SyncTransport, S: SyncStore + 'static> SyncEngine<T, S> {
    /// Pushes the local changes of one model.
    pub async fn push(self: &Arc<Self>, model: &str) -> SyncResult<PhaseOutcome> {
        let schema = Arc::clone(self.registry.get(model)?);
        let credential = self.credential()?;
        Ok(self.push_model(&schema, credential.as_ref()).await)
    }

    pub(crate) async fn push_model(
        self: &Arc<Self>,
        schema: &Arc<dyn ModelSchema>,
        credential: Option<&Credential>,
    ) -> PhaseOutcome {
        let model = schema.name();
        if schema.read_only() {
            return PhaseOutcome::Skipped(SkipReason::ReadOnly);
        }
        let Some(credential) = credential else {
            debug!(model, "anonymous, push skipped");
            return PhaseOutcome::Skipped(SkipReason::Anonymous);
        };

        let lease = match self.leases.try_write(model) {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(model, "write lease held elsewhere, push skipped");
                return PhaseOutcome::Skipped(SkipReason::LeaseHeld);
            }
            Err(e) => return self.handle_failure(model, SyncPhase::Push, e),
        };

        let result = self.push_locked(schema, credential).await;
        if let Err(e) = lease.release() {
            warn!(model, error = %e, "failed to release write lease");
        }

        match result {
            Ok(outcome) => {
                if let PhaseOutcome::Pushed {
                    written, deleted, ..
                } = outcome
                {
                    if written + deleted > 0 {
                        info!(model, written, deleted, "push complete");
                    }
                    self.record_stats(|stats| {
                        stats.records_pushed += written as u64;
                        stats.records_deleted += deleted as u64;
                    });
                    self.emit(SyncEvent::Pushed {
                        model: model.to_string(),
                        written,
                        deleted,
                    });
                }
                outcome
            }
            Err(e) => self.handle_failure(model, SyncPhase::Push, e),
        }
    }

    async fn push_locked(
        &self,
        schema: &Arc<dyn ModelSchema>,
        credential: &Credential,
    ) -> SyncResult<PhaseOutcome> {
        let model = schema.name();
        let dirty = Query::filter(Filter::status([
            SyncStatus::Created,
            SyncStatus::Updated,
            SyncStatus::Deleted,
        ]))
        .including_deleted();
        let plan = PushPlan::from_records(self.store.query(model, &dirty)?);

        let purged = plan.local_only.len();
        if purged > 0 {
            let purges: Vec<StoreChange> = plan
                .local_only
                .iter()
                .map(|r| StoreChange::Purge {
                    client_id: r.client_id.clone(),
                })
                .collect();
            self.store.apply(model, &purges)?;
            debug!(model, purged, "purged records deleted before their first push");
        }

        let mut written = 0;
        if !plan.writes.is_empty() {
            let request = self.batch_request(schema.as_ref(), credential, &plan.writes)?;
            debug!(model, records = plan.writes.len(), "sending create/update batch");
            let response = self.transport.create_or_update(&request).await?;
            let acks = acknowledgements(model, &plan.writes, &response);
            written = acks.len();
            self.store.apply(model, &acks)?;
        }

        let mut deleted = 0;
        if !plan.deletes.is_empty() {
            let request = self.batch_request(schema.as_ref(), credential, &plan.deletes)?;
            debug!(model, records = plan.deletes.len(), "sending delete batch");
            self.transport.delete(&request).await?;
            let purges: Vec<StoreChange> = plan
                .deletes
                .iter()
                .map(|r| StoreChange::Purge {
                    client_id: r.client_id.clone(),
                })
                .collect();
            self.store.apply(model, &purges)?;
            deleted = purges.len();
        }

        Ok(PhaseOutcome::Pushed {
            written,
            deleted,
            purged,
        })
    }

    fn batch_request(
        &self,
        schema: &dyn ModelSchema,
        credential: &Credential,
        records: &[Record],
    ) -> SyncResult<BatchRequest> {
        Ok(BatchRequest {
            version: schema.version(),
            table: schema.table().to_string(),
            view: schema.view().to_string(),
            credential: credential.as_str().to_string(),
            batch: schema.serialize_batch(records)?,
        })
    }
}
