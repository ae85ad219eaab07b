//! # Tagsim CLI (`tagsim`)
//!
//! Operator tooling for a tagsim deployment: database initialization,
//! service and process inspection, and startup crash recovery. Index builds
//! themselves run inside the host process embedding the [`tagsim`] engine,
//! so the CLI only exposes the database-backed surface.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tagsim init` | Create the SQLite database and run schema migrations |
//! | `tagsim services` | List registered services and their status |
//! | `tagsim processes` | List background processes, optionally per service |
//! | `tagsim recover` | Force-error stale processes and settle busy services |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tagsim::config;
use tagsim::db;
use tagsim::docstore::MemoryDocumentStore;
use tagsim::engine::Engine;
use tagsim::migrate;

/// Tagsim — per-tag document-similarity index engine.
#[derive(Parser)]
#[command(
    name = "tagsim",
    about = "Per-tag document-similarity index engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tagsim.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (services,
    /// processes, similarity_edges). Idempotent.
    Init,

    /// List registered services and their lifecycle status.
    Services,

    /// List background processes, newest last.
    Processes {
        /// Only show processes belonging to this service.
        #[arg(long)]
        service: Option<String>,
    },

    /// Run crash recovery: force-error processes left `in_progress` by a
    /// previous run and settle services stuck in `busy`.
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let pool = db::connect(&cfg).await?;

    if matches!(cli.command, Commands::Init) {
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    // The CLI has no external document store; inspection and recovery only
    // touch the database and artifact files.
    let engine = Engine::new(cfg, pool, Arc::new(MemoryDocumentStore::new()));

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Services => {
            let services = engine.list_services().await?;
            if services.is_empty() {
                println!("No services registered.");
            }
            for service in services {
                println!(
                    "{}  kind={}  status={}  alias={}  processes={}",
                    service.id,
                    service.kind.as_str(),
                    service.status.as_str(),
                    service.alias.as_deref().unwrap_or("-"),
                    service.process_ids.len()
                );
            }
        }
        Commands::Processes { service } => {
            let processes = engine.list_processes(service.as_deref()).await?;
            if processes.is_empty() {
                println!("No processes recorded.");
            }
            for process in processes {
                println!(
                    "{}  {}  object={}  status={}  {}%  started={}  errors={}",
                    process.id,
                    process.kind.as_str(),
                    process.object_id,
                    process.status.as_str(),
                    process.percent,
                    process.started_at.to_rfc3339(),
                    process.errors.len()
                );
            }
        }
        Commands::Recover => {
            engine.recover().await?;
            println!("Recovery complete.");
        }
    }

    Ok(())
}
