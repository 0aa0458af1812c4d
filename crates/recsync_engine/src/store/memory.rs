//! Volatile store for tests and short-lived clients.

use crate::error::SyncResult;
use crate::metadata::{MetadataStore, SyncMetadata};
use crate::model::Record;
use crate::store::table::Snapshot;
use crate::store::{Query, RecordStore, StoreChange};
use parking_lot::RwLock;

/// An in-memory [`RecordStore`] and [`MetadataStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Snapshot>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-filled with records of one model.
    pub fn with_records(model: &str, records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        store
            .state
            .write()
            .tables
            .insert(model.to_string(), records.into_iter().collect::<Vec<_>>().into());
        store
    }
}

impl RecordStore for MemoryStore {
    fn query(&self, model: &str, query: &Query) -> SyncResult<Vec<Record>> {
        Ok(self.state.read().query(model, query))
    }

    fn get(&self, model: &str, client_id: &str) -> SyncResult<Option<Record>> {
        Ok(self.state.read().get(model, client_id))
    }

    fn find_by_server_id(&self, model: &str, server_id: i64) -> SyncResult<Option<Record>> {
        Ok(self.state.read().find_by_server_id(model, server_id))
    }

    fn apply(&self, model: &str, changes: &[StoreChange]) -> SyncResult<()> {
        let mut state = self.state.write();
        let table = state.stage(model, changes)?;
        state.tables.insert(model.to_string(), table);
        Ok(())
    }
}

impl MetadataStore for MemoryStore {
    fn load_metadata(&self, model: &str) -> SyncResult<Option<SyncMetadata>> {
        Ok(self.state.read().metadata.get(model).cloned())
    }

    fn list_metadata(&self) -> SyncResult<Vec<SyncMetadata>> {
        Ok(self.state.read().metadata.values().cloned().collect())
    }

    fn update_metadata(
        &self,
        model: &str,
        update: &mut dyn FnMut(&mut SyncMetadata),
    ) -> SyncResult<SyncMetadata> {
        let mut state = self.state.write();
        let metadata = state.stage_metadata(model, update);
        state.metadata.insert(model.to_string(), metadata.clone());
        Ok(metadata)
    }
}
