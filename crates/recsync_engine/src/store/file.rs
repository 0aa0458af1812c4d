//! JSON-file backed store.
//!
//! The whole store is one JSON document. Every committed batch and metadata
//! update rewrites it through a temporary file followed by a rename, so a
//! crash leaves either the old or the new document on disk.

use crate::error::SyncResult;
use crate::metadata::{MetadataStore, SyncMetadata};
use crate::model::Record;
use crate::store::table::Snapshot;
use crate::store::{Query, RecordStore, StoreChange};
use parking_lot::RwLock;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A durable [`RecordStore`] and [`MetadataStore`] kept in a single file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: RwLock<Snapshot>,
}

impl FileStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                Snapshot::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            Snapshot::default()
        };
        debug!(path = %path.display(), models = state.tables.len(), "opened file store");
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &Snapshot) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, state)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RecordStore for FileStore {
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
        let mut next = state.clone();
        next.tables.insert(model.to_string(), table);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }
}

impl MetadataStore for FileStore {
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
        if state.metadata.get(model) == Some(&metadata) {
            return Ok(metadata);
        }
        let mut next = state.clone();
        next.metadata.insert(model.to_string(), metadata.clone());
        self.persist(&next)?;
        *state = next;
        Ok(metadata)
    }
}
