//! In-memory tables shared by the memory and file stores.

use crate::error::{SyncError, SyncResult};
use crate::metadata::SyncMetadata;
use crate::model::{Record, SyncStatus};
use crate::store::{Query, StoreChange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Records of one model, keyed by client id with a server-id index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Record>", into = "Vec<Record>")]
pub(crate) struct ModelTable {
    records: BTreeMap<String, Record>,
    by_server_id: BTreeMap<i64, String>,
}

impl From<Vec<Record>> for ModelTable {
    fn from(records: Vec<Record>) -> Self {
        let mut table = Self::default();
        for record in records {
            table.put(record);
        }
        table
    }
}

impl From<ModelTable> for Vec<Record> {
    fn from(table: ModelTable) -> Self {
        table.records.into_values().collect()
    }
}

impl ModelTable {
    pub(crate) fn query(&self, query: &Query) -> Vec<Record> {
        query.run(self.records.values())
    }

    pub(crate) fn get(&self, client_id: &str) -> Option<&Record> {
        self.records.get(client_id)
    }

    pub(crate) fn find_by_server_id(&self, server_id: i64) -> Option<&Record> {
        self.by_server_id
            .get(&server_id)
            .and_then(|client_id| self.records.get(client_id))
    }

    /// Inserts or replaces a record, keeping the index consistent.
    fn put(&mut self, record: Record) {
        if let Some(previous) = self.records.get(&record.client_id) {
            if let Some(old_id) = previous.id {
                self.by_server_id.remove(&old_id);
            }
        }
        if let Some(id) = record.id {
            if let Some(holder) = self.by_server_id.get(&id).cloned() {
                if holder != record.client_id {
                    // Two local copies of one server record: keep the incoming one.
                    self.records.remove(&holder);
                }
            }
            self.by_server_id.insert(id, record.client_id.clone());
        }
        self.records.insert(record.client_id.clone(), record);
    }

    fn remove(&mut self, client_id: &str) -> Option<Record> {
        let record = self.records.remove(client_id)?;
        if let Some(id) = record.id {
            self.by_server_id.remove(&id);
        }
        Some(record)
    }

    fn client_id_for(&self, server_id: i64, client_id: Option<&str>) -> Option<String> {
        self.by_server_id.get(&server_id).cloned().or_else(|| {
            client_id
                .filter(|cid| self.records.contains_key(*cid))
                .map(str::to_string)
        })
    }

    /// Applies one change. Callers apply batches to a copy so a failure
    /// leaves the table untouched.
    pub(crate) fn apply(&mut self, model: &str, change: &StoreChange) -> SyncResult<()> {
        match change {
            StoreChange::Insert(record) => {
                if self.records.contains_key(&record.client_id) {
                    return Err(SyncError::InvalidWrite(format!(
                        "client id {} already exists in {model}",
                        record.client_id
                    )));
                }
                if let Some(id) = record.id {
                    if self.by_server_id.contains_key(&id) {
                        return Err(SyncError::InvalidWrite(format!(
                            "server id {id} already exists in {model}"
                        )));
                    }
                }
                self.put(record.clone());
            }
            StoreChange::Update { client_id, fields } => {
                let mut record = self.existing(model, client_id)?.clone();
                if record.sync_status == SyncStatus::Deleted {
                    return Err(SyncError::InvalidWrite(format!(
                        "record {client_id} in {model} is deleted"
                    )));
                }
                record
                    .fields
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                if record.sync_status == SyncStatus::Current {
                    record.sync_status = SyncStatus::Updated;
                }
                self.put(record);
            }
            StoreChange::MarkDeleted { client_id } => {
                let mut record = self.existing(model, client_id)?.clone();
                if record.id.is_none() {
                    self.remove(client_id);
                } else {
                    record.sync_status = SyncStatus::Deleted;
                    self.put(record);
                }
            }
            StoreChange::Acknowledge {
                client_id,
                server_id,
                sent,
            } => {
                // The sent record wins over a pulled copy of the same server row.
                let key = if self.records.contains_key(client_id) {
                    Some(client_id.clone())
                } else {
                    self.by_server_id.get(server_id).cloned()
                };
                let Some(key) = key else {
                    warn!(model, client_id = %client_id, server_id, "acknowledged record no longer exists");
                    return Ok(());
                };
                let Some(mut record) = self.records.get(&key).cloned() else {
                    return Ok(());
                };
                record.id = Some(*server_id);
                record.sync_status = match record.sync_status {
                    SyncStatus::Deleted => SyncStatus::Deleted,
                    _ if record.fields == *sent => SyncStatus::Current,
                    _ => SyncStatus::Updated,
                };
                self.put(record);
            }
            StoreChange::Purge { client_id } => {
                self.remove(client_id);
            }
            StoreChange::UpsertRemote {
                server_id,
                client_id,
                fields,
            } => match self.client_id_for(*server_id, client_id.as_deref()) {
                Some(key) => {
                    if let Some(mut record) = self.records.get(&key).cloned() {
                        record.id = Some(*server_id);
                        record
                            .fields
                            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                        if record.sync_status == SyncStatus::Created {
                            record.sync_status = SyncStatus::Current;
                        }
                        self.put(record);
                    }
                }
                None => {
                    self.put(Record::from_server(
                        *server_id,
                        client_id.clone().filter(|cid| !cid.is_empty()),
                        fields.clone(),
                    ));
                }
            },
            StoreChange::DeleteRemote { server_id } => {
                if let Some(client_id) = self.by_server_id.get(server_id).cloned() {
                    self.remove(&client_id);
                }
            }
        }
        Ok(())
    }

    fn existing(&self, model: &str, client_id: &str) -> SyncResult<&Record> {
        self.records
            .get(client_id)
            .ok_or_else(|| SyncError::RecordNotFound {
                model: model.to_string(),
                client_id: client_id.to_string(),
            })
    }
}

/// Whole-store state: every model's table plus the metadata table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    #[serde(default)]
    pub(crate) tables: BTreeMap<String, ModelTable>,
    #[serde(default)]
    pub(crate) metadata: BTreeMap<String, SyncMetadata>,
}

impl Snapshot {
    pub(crate) fn query(&self, model: &str, query: &Query) -> Vec<Record> {
        self.tables
            .get(model)
            .map(|t| t.query(query))
            .unwrap_or_default()
    }

    pub(crate) fn get(&self, model: &str, client_id: &str) -> Option<Record> {
        self.tables.get(model)?.get(client_id).cloned()
    }

    pub(crate) fn find_by_server_id(&self, model: &str, server_id: i64) -> Option<Record> {
        self.tables.get(model)?.find_by_server_id(server_id).cloned()
    }

    /// Applies the changes to a copy of the model's table and returns it.
    pub(crate) fn stage(&self, model: &str, changes: &[StoreChange]) -> SyncResult<ModelTable> {
        let mut table = self.tables.get(model).cloned().unwrap_or_default();
        for change in changes {
            table.apply(model, change)?;
        }
        Ok(table)
    }

    /// Runs an update on a copy of a model's metadata and returns it.
    pub(crate) fn stage_metadata(
        &self,
        model: &str,
        update: &mut dyn FnMut(&mut SyncMetadata),
    ) -> SyncMetadata {
        let mut metadata = self
            .metadata
            .get(model)
            .cloned()
            .unwrap_or_else(|| SyncMetadata::new(model));
        update(&mut metadata);
        metadata
    }
}
