//! Sync command implementation.

use super::CliEngine;
use recsync_engine::{PhaseOutcome, SkipReason};
use std::sync::Arc;

fn describe(outcome: &PhaseOutcome) -> String {
    match outcome {
        PhaseOutcome::Skipped(SkipReason::LeaseHeld) => "skipped (lease held)".to_string(),
        PhaseOutcome::Skipped(SkipReason::ReadOnly) => "skipped (read-only)".to_string(),
        PhaseOutcome::Skipped(SkipReason::Anonymous) => "skipped (no credential)".to_string(),
        PhaseOutcome::Pushed {
            written,
            deleted,
            purged,
        } => format!("{written} written, {deleted} deleted, {purged} purged"),
        PhaseOutcome::Pulled {
            applied,
            removed,
            watermark,
        } => format!("{applied} applied, {removed} removed, watermark {watermark}"),
        PhaseOutcome::Failed {
            error,
            retry_scheduled,
        } => {
            if *retry_scheduled {
                format!("failed: {error} (retry scheduled)")
            } else {
                format!("failed: {error}")
            }
        }
    }
}

/// Runs the sync command.
pub async fn run(
    engine: &Arc<CliEngine>,
    models: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let report = if models.is_empty() {
        engine.sync_all().await?
    } else {
        let names: Vec<&str> = models.iter().map(String::as_str).collect();
        engine.sync(&names).await?
    };

    for model in &report.models {
        println!("{}", model.model);
        println!("  push: {}", describe(&model.push));
        println!("  pull: {}", describe(&model.pull));
    }
    println!("Finished in {:.2}s", report.duration.as_secs_f64());

    if report.is_success() {
        Ok(())
    } else {
        Err("sync finished with failures".into())
    }
}
