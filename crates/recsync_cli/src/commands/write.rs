//! Local write commands: create, update, delete.

use super::CliEngine;
use std::collections::BTreeMap;

/// Creates a record and prints it.
pub fn create(
    engine: &CliEngine,
    model: &str,
    fields: Vec<(String, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let record = engine.create(model, fields.into_iter().collect::<BTreeMap<_, _>>())?;
    println!("{}", serde_json::to_string(&record)?);
    Ok(())
}

/// Updates fields of a record and prints it.
pub fn update(
    engine: &CliEngine,
    model: &str,
    client_id: &str,
    fields: Vec<(String, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    if fields.is_empty() {
        return Err("nothing to update, pass at least one --set field=value".into());
    }
    let record = engine.update(model, client_id, fields.into_iter().collect())?;
    println!("{}", serde_json::to_string(&record)?);
    Ok(())
}

/// Deletes a record.
pub fn delete(
    engine: &CliEngine,
    model: &str,
    client_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    engine.delete(model, client_id)?;
    println!("Deleted {client_id} from {model}");
    Ok(())
}
