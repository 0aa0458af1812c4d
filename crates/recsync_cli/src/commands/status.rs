//! Status command implementation.

use super::CliEngine;
use recsync_engine::{Query, RecordStore, SyncStatus};
use serde::Serialize;

/// Sync state of one model.
#[derive(Debug, Serialize)]
pub struct ModelStatus {
    /// Model name.
    pub model: String,
    /// Remote table.
    pub table: String,
    /// Whether the model is pull-only.
    pub read_only: bool,
    /// Watermark of the last pull.
    pub last_sync: Option<String>,
    /// Write lease expiry, if held.
    pub write_lease_expiry: Option<String>,
    /// Read lease expiry, if held.
    pub read_lease_expiry: Option<String>,
    /// Records in sync.
    pub current: usize,
    /// Records waiting to be created on the server.
    pub created: usize,
    /// Records waiting to be updated on the server.
    pub updated: usize,
    /// Records waiting to be deleted on the server.
    pub deleted: usize,
}

/// Runs the status command.
pub fn run(engine: &CliEngine, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut rows = Vec::new();
    for schema in engine.registry().iter() {
        let name = schema.name();
        let metadata = engine.metadata(name)?;
        let records = engine
            .store()
            .query(name, &Query::all().including_deleted())?;
        let count = |status: SyncStatus| records.iter().filter(|r| r.sync_status == status).count();
        rows.push(ModelStatus {
            model: name.to_string(),
            table: schema.table().to_string(),
            read_only: schema.read_only(),
            last_sync: metadata.last_sync.map(|ts| ts.to_rfc3339()),
            write_lease_expiry: metadata.write_lease_expiry.map(|ts| ts.to_rfc3339()),
            read_lease_expiry: metadata.read_lease_expiry.map(|ts| ts.to_rfc3339()),
            current: count(SyncStatus::Current),
            created: count(SyncStatus::Created),
            updated: count(SyncStatus::Updated),
            deleted: count(SyncStatus::Deleted),
        });
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        "text" => {
            for row in &rows {
                println!(
                    "{}{}",
                    row.model,
                    if row.read_only { " (read-only)" } else { "" }
                );
                println!("  table:      {}", row.table);
                println!(
                    "  last sync:  {}",
                    row.last_sync.as_deref().unwrap_or("never")
                );
                println!(
                    "  records:    {} current, {} created, {} updated, {} deleted",
                    row.current, row.created, row.updated, row.deleted
                );
                if let Some(expiry) = &row.write_lease_expiry {
                    println!("  write lease until {expiry}");
                }
                if let Some(expiry) = &row.read_lease_expiry {
                    println!("  read lease until {expiry}");
                }
            }
        }
        other => return Err(format!("unknown format {other:?}, expected text or json").into()),
    }
    Ok(())
}
