//! Records, sync status, and the model registry.
//!
//! Every synchronized model type is described by a [`ModelSchema`]: where it
//! lives on the server (table, view, version), whether it may be written, and
//! how its records are turned into a wire batch and back. The engine only
//! ever sees records through this interface, so heterogeneous models share
//! one code path.

use crate::error::{SyncError, SyncResult};
use recsync_protocol::{RecordBatch, Row, CLIENT_ID_COLUMN, DELETE_COLUMN, ID_COLUMN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Synchronization state of a local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// In sync with the server.
    Current,
    /// Created locally, never pushed.
    Created,
    /// Modified locally since the last push.
    Updated,
    /// Deleted locally, waiting for the server to confirm.
    Deleted,
}

impl SyncStatus {
    /// Returns true if the record has local changes not yet on the server.
    pub fn is_dirty(self) -> bool {
        !matches!(self, SyncStatus::Current)
    }

    /// Returns true if the record belongs in a create/update batch.
    pub fn needs_write(self) -> bool {
        matches!(self, SyncStatus::Created | SyncStatus::Updated)
    }
}

/// A locally stored record of some model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Server-assigned id, absent until the first successful push.
    pub id: Option<i64>,
    /// Client-generated id, stable for the life of the record.
    pub client_id: String,
    /// Synchronization state.
    pub sync_status: SyncStatus,
    /// Model-specific fields.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Record {
    /// Creates a new local record with a fresh client id.
    pub fn new_local(fields: BTreeMap<String, String>) -> Self {
        Self::with_client_id(uuid::Uuid::new_v4().to_string(), fields)
    }

    /// Creates a new local record with the given client id.
    pub fn with_client_id(client_id: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            id: None,
            client_id: client_id.into(),
            sync_status: SyncStatus::Created,
            fields,
        }
    }

    /// Creates a record that mirrors a server row.
    pub fn from_server(
        id: i64,
        client_id: Option<String>,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Some(id),
            client_id: client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            sync_status: SyncStatus::Current,
            fields,
        }
    }

    /// Returns the value of a column, including the reserved `id` and `client_id`.
    pub fn value(&self, column: &str) -> Option<String> {
        match column {
            ID_COLUMN => self.id.map(|id| id.to_string()),
            CLIENT_ID_COLUMN => Some(self.client_id.clone()),
            other => self.fields.get(other).cloned(),
        }
    }

    /// Returns a model field.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

/// Capability interface of a synchronized model type.
pub trait ModelSchema: Send + Sync + fmt::Debug {
    /// Model name, the key of its sync metadata.
    fn name(&self) -> &str;

    /// Remote table name.
    fn table(&self) -> &str;

    /// Remote view name.
    fn view(&self) -> &str;

    /// Model version tag sent with every request.
    fn version(&self) -> u32;

    /// Read-only models are pulled but never pushed.
    fn read_only(&self) -> bool {
        false
    }

    /// Serializes records into a request batch.
    fn serialize_batch(&self, records: &[Record]) -> SyncResult<RecordBatch>;

    /// Extracts the model fields from a pulled row.
    fn import_row(&self, row: &Row) -> BTreeMap<String, String>;
}

/// A declarative model description, loadable from a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model name.
    pub name: String,
    /// Remote table name.
    pub table: String,
    /// Remote view name.
    #[serde(default = "default_view")]
    pub view: String,
    /// Model version tag.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Whether the model is pull-only.
    #[serde(default)]
    pub read_only: bool,
    /// Field columns in wire order. Empty means every field that appears.
    #[serde(default)]
    pub columns: Vec<String>,
}

fn default_view() -> String {
    "default".to_string()
}

fn default_version() -> u32 {
    1
}

impl ModelDescriptor {
    /// Creates a descriptor with the default view and version.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            view: default_view(),
            version: default_version(),
            read_only: false,
            columns: Vec::new(),
        }
    }

    /// Sets the view.
    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = view.into();
        self
    }

    /// Sets the version tag.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the field columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the model as pull-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn field_columns(&self, records: &[Record]) -> Vec<String> {
        if !self.columns.is_empty() {
            return self.columns.clone();
        }
        let names: BTreeSet<&String> = records.iter().flat_map(|r| r.fields.keys()).collect();
        names.into_iter().cloned().collect()
    }

    fn is_reserved(column: &str) -> bool {
        matches!(column, ID_COLUMN | CLIENT_ID_COLUMN | DELETE_COLUMN)
    }
}

impl ModelSchema for ModelDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn view(&self) -> &str {
        &self.view
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn serialize_batch(&self, records: &[Record]) -> SyncResult<RecordBatch> {
        let fields = self.field_columns(records);
        if let Some(reserved) = fields.iter().find(|c| Self::is_reserved(c)) {
            return Err(SyncError::Config(format!(
                "model {} uses reserved column {reserved:?}",
                self.name
            )));
        }

        let mut columns = vec![ID_COLUMN.to_string(), CLIENT_ID_COLUMN.to_string()];
        columns.extend(fields.iter().cloned());

        let mut batch = RecordBatch::new(columns);
        for record in records {
            let mut row = Vec::with_capacity(fields.len() + 2);
            row.push(record.id.map(|id| id.to_string()).unwrap_or_default());
            row.push(record.client_id.clone());
            row.extend(
                fields
                    .iter()
                    .map(|f| record.fields.get(f).cloned().unwrap_or_default()),
            );
            batch.push_row(row)?;
        }
        Ok(batch)
    }

    fn import_row(&self, row: &Row) -> BTreeMap<String, String> {
        row.fields()
            .iter()
            .filter(|(column, _)| !Self::is_reserved(column))
            .filter(|(column, _)| self.columns.is_empty() || self.columns.contains(*column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }
}

/// Registry of the model types the engine synchronizes.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<dyn ModelSchema>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model, replacing any model with the same name.
    pub fn register(&mut self, schema: impl ModelSchema + 'static) -> &mut Self {
        self.register_arc(Arc::new(schema))
    }

    /// Registers a shared model schema.
    pub fn register_arc(&mut self, schema: Arc<dyn ModelSchema>) -> &mut Self {
        self.models.insert(schema.name().to_string(), schema);
        self
    }

    /// Looks up a model by name.
    pub fn get(&self, name: &str) -> SyncResult<&Arc<dyn ModelSchema>> {
        self.models
            .get(name)
            .ok_or_else(|| SyncError::UnknownModel(name.to_string()))
    }

    /// Returns true if the model is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Returns the registered model names in order.
    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Iterates over the registered schemas.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ModelSchema>> {
        self.models.values()
    }

    /// Returns the number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no model is registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl<S: ModelSchema + 'static> FromIterator<S> for ModelRegistry {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut registry = Self::new();
        for schema in iter {
            registry.register(schema);
        }
        registry
    }
}
