//! CLI command implementations.

pub mod query;
pub mod status;
pub mod sync;
pub mod write;

use crate::manifest::Manifest;
use recsync_engine::{
    Credential, CredentialCell, FileStore, HttpTransport, ReqwestClient, SyncEngine,
};
use std::path::Path;
use std::sync::Arc;

/// The engine as the CLI runs it.
pub type CliEngine = SyncEngine<HttpTransport<ReqwestClient>, FileStore>;

/// Opens the store, builds the engine and creates missing metadata rows.
pub fn open_engine(
    store: &Path,
    manifest: &Manifest,
    token: Option<&str>,
) -> Result<Arc<CliEngine>, Box<dyn std::error::Error>> {
    let config = manifest.config();
    let client = ReqwestClient::new(config.request_timeout)?;
    let transport = HttpTransport::new(manifest.server.clone(), client);
    let store = Arc::new(FileStore::open(store)?);

    let credentials = CredentialCell::new();
    if let Some(token) = token {
        credentials.set(Credential::new(token));
    }

    let engine = SyncEngine::builder(transport, store)
        .config(config)
        .registry(manifest.registry())
        .credentials(credentials)
        .build();
    engine.configure()?;
    Ok(engine)
}

/// Parses a `field=value` argument.
pub fn parse_assignment(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((field, value)) if !field.trim().is_empty() => {
            Ok((field.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected field=value, got {arg:?}")),
    }
}
