//! Query command implementation.

use super::CliEngine;
use recsync_engine::{BelatedResponse, Filter, Query, Record, RecordStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Options of the query command.
#[derive(Debug, Default)]
pub struct QueryOptions {
    /// Field equality conditions, all of which must hold.
    pub conditions: Vec<(String, String)>,
    /// Column to sort by.
    pub order: Option<String>,
    /// Sort descending.
    pub descending: bool,
    /// Include records waiting for deletion.
    pub include_deleted: bool,
    /// Refresh from the server when the last pull is older than this.
    pub max_age: Option<Duration>,
}

/// Builds the store query.
pub fn build_query(options: &QueryOptions) -> Query {
    let filter = match options.conditions.len() {
        0 => Filter::All,
        _ => Filter::And(
            options
                .conditions
                .iter()
                .map(|(field, value)| Filter::equals(field.clone(), value.clone()))
                .collect(),
        ),
    };
    let mut query = Query::filter(filter);
    if let Some(column) = &options.order {
        query = query.order_by(column.clone(), !options.descending);
    }
    if options.include_deleted {
        query = query.including_deleted();
    }
    query
}

fn print_records(records: &[Record]) -> Result<(), Box<dyn std::error::Error>> {
    for record in records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

/// Runs the query command.
pub async fn run(
    engine: &Arc<CliEngine>,
    model: &str,
    options: &QueryOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let query = build_query(options);
    let Some(max_age) = options.max_age else {
        return print_records(&engine.store().query(model, &query)?);
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(move |response: BelatedResponse| {
        // The receiver outlives every notification.
        let _ = tx.send(response);
    });
    let result = engine.query(model, query, max_age, listener)?;
    print_records(&result.records)?;

    if let Some(pending) = result.pending {
        pending.finished().await;
        if let Ok(response) = rx.try_recv() {
            match &response.error {
                Some(error) => eprintln!("refresh failed: {error}"),
                None => eprintln!("refreshed from server"),
            }
            print_records(&response.records)?;
        }
    }
    Ok(())
}
