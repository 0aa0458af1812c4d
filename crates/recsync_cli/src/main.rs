//! recsync CLI
//!
//! Command-line client for the recsync engine. Records live in a local JSON
//! store; the manifest names the server and the synchronized models.
//!
//! # Commands
//!
//! - `sync` - Push local changes and pull remote ones
//! - `status` - Show watermarks, leases and pending changes per model
//! - `query` - Query local records, optionally refreshing stale data
//! - `create`, `update`, `delete` - Edit local records

mod commands;
mod manifest;

use clap::{Parser, Subcommand};
use commands::query::QueryOptions;
use manifest::Manifest;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Offline-first record sync client.
#[derive(Parser)]
#[command(name = "recsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local record store
    #[arg(global = true, short, long, default_value = "recsync.json")]
    store: PathBuf,

    /// Path to the model manifest
    #[arg(global = true, short, long, default_value = "recsync-manifest.json")]
    manifest: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push local changes and pull remote ones
    Sync {
        /// Bearer token; models are synced anonymously without one
        #[arg(short, long, env = "RECSYNC_TOKEN")]
        token: Option<String>,

        /// Models to sync (all when omitted)
        #[arg(long = "model")]
        models: Vec<String>,
    },

    /// Show sync state per model
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Query local records
    Query {
        /// Model to query
        #[arg(long)]
        model: String,

        /// Equality condition, repeatable
        #[arg(long = "where", value_parser = commands::parse_assignment)]
        conditions: Vec<(String, String)>,

        /// Column to sort by
        #[arg(long)]
        order: Option<String>,

        /// Sort descending
        #[arg(long)]
        desc: bool,

        /// Include records waiting for deletion
        #[arg(long)]
        deleted: bool,

        /// Refresh from the server when the last pull is older than this many seconds
        #[arg(long)]
        max_age: Option<u64>,

        /// Bearer token used by the refresh
        #[arg(short, long, env = "RECSYNC_TOKEN")]
        token: Option<String>,
    },

    /// Create a local record
    Create {
        /// Model of the record
        #[arg(long)]
        model: String,

        /// Field value, repeatable
        #[arg(long = "set", value_parser = commands::parse_assignment)]
        fields: Vec<(String, String)>,
    },

    /// Update fields of a local record
    Update {
        /// Model of the record
        #[arg(long)]
        model: String,

        /// Client id of the record
        #[arg(long)]
        client_id: String,

        /// Field value, repeatable
        #[arg(long = "set", value_parser = commands::parse_assignment)]
        fields: Vec<(String, String)>,
    },

    /// Delete a local record
    Delete {
        /// Model of the record
        #[arg(long)]
        model: String,

        /// Client id of the record
        #[arg(long)]
        client_id: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("recsync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let manifest = Manifest::load(&cli.manifest)?;
    match cli.command {
        Commands::Sync { token, models } => {
            let engine = commands::open_engine(&cli.store, &manifest, token.as_deref())?;
            commands::sync::run(&engine, &models).await?;
        }
        Commands::Status { format } => {
            let engine = commands::open_engine(&cli.store, &manifest, None)?;
            commands::status::run(&engine, &format)?;
        }
        Commands::Query {
            model,
            conditions,
            order,
            desc,
            deleted,
            max_age,
            token,
        } => {
            let engine = commands::open_engine(&cli.store, &manifest, token.as_deref())?;
            let options = QueryOptions {
                conditions,
                order,
                descending: desc,
                include_deleted: deleted,
                max_age: max_age.map(Duration::from_secs),
            };
            commands::query::run(&engine, &model, &options).await?;
        }
        Commands::Create { model, fields } => {
            let engine = commands::open_engine(&cli.store, &manifest, None)?;
            commands::write::create(&engine, &model, fields)?;
        }
        Commands::Update {
            model,
            client_id,
            fields,
        } => {
            let engine = commands::open_engine(&cli.store, &manifest, None)?;
            commands::write::update(&engine, &model, &client_id, fields)?;
        }
        Commands::Delete { model, client_id } => {
            let engine = commands::open_engine(&cli.store, &manifest, None)?;
            commands::write::delete(&engine, &model, &client_id)?;
        }
        Commands::Version => {}
    }

    Ok(())
}
