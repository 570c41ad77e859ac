//! Inspection tool for the AlbumKit offline store.
//!
//! Provides commands for:
//! - Listing cache generations and their keys
//! - Listing mutations waiting for replay
//! - Evicting every generation but one
//!
//! ## Usage
//!
//! ```bash
//! # List generations in the default store
//! offline-inspect generations
//!
//! # Keys of one generation, as JSON
//! offline-inspect --json keys album-cache-v7
//!
//! # Pending mutations in a specific store
//! offline-inspect --db ./offline.db pending
//!
//! # Drop everything except the current generation
//! offline-inspect evict album-cache-v7
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use albumkit_common::{init_logging, LogConfig, LogFormat};
use albumkit_store::SqliteStore;
use albumkit_sw::{default_store_path, CacheGeneration, ReplayQueue, VersionedCacheStore, WorkerConfig};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

mod report;

use report::{GenerationSummary, PendingSummary};

#[derive(Parser)]
#[command(name = "offline-inspect")]
#[command(about = "Inspect and maintain the AlbumKit offline store")]
struct Cli {
    /// SQLite store path (defaults to the platform cache directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Worker configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cache generations with their entry counts
    Generations,

    /// List the request keys cached in one generation
    Keys {
        /// Generation name
        generation: String,
    },

    /// List mutations waiting for replay
    Pending,

    /// Delete every generation except one
    Evict {
        /// Generation to keep
        keep: String,
        /// Only print what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig::default().with_format(cli.log_format))?;

    let config = match &cli.config {
        Some(path) => WorkerConfig::from_json_file(path)?,
        None => WorkerConfig::default(),
    };
    let db = cli.db.clone().unwrap_or_else(default_store_path);
    if !db.exists() {
        bail!("no offline store at {}", db.display());
    }
    debug!(db = %db.display(), "Opening store");

    let store = Arc::new(
        SqliteStore::open(&db).with_context(|| format!("opening {}", db.display()))?,
    );
    let caches = VersionedCacheStore::new(store.clone());

    match cli.command {
        Commands::Generations => {
            let mut summaries = Vec::new();
            for name in caches.generations().await? {
                let entries = caches.handle(&CacheGeneration::named(&name)).keys().await?.len();
                summaries.push(GenerationSummary { name, entries });
            }
            print_out(cli.json, &summaries, report::render_generations(&summaries))?;
        }

        Commands::Keys { generation } => {
            let generation = CacheGeneration::named(generation);
            if !caches.generations().await?.iter().any(|n| n == generation.name()) {
                bail!("no generation named {}", generation);
            }
            let keys = caches.handle(&generation).keys().await?;
            print_out(cli.json, &keys, keys.join("\n"))?;
        }

        Commands::Pending => {
            let queue = ReplayQueue::new(
                store,
                config.replay_store.clone(),
                config.persist_mutation_responses,
            );
            let pending: Vec<PendingSummary> = queue
                .peek()
                .await?
                .iter()
                .map(|(_, entry)| PendingSummary::from_entry(entry))
                .collect();
            print_out(cli.json, &pending, report::render_pending(&pending))?;
        }

        Commands::Evict { keep, dry_run } => {
            let keep = CacheGeneration::named(keep);
            let names = caches.generations().await?;
            if !names.iter().any(|n| n == keep.name()) {
                bail!("refusing to evict: generation {} does not exist", keep);
            }
            let deleted = if dry_run {
                names.into_iter().filter(|n| n != keep.name()).collect()
            } else {
                caches.retain_only(&keep).await?
            };
            print_out(cli.json, &deleted, report::render_evicted(&deleted, dry_run))?;
        }
    }

    Ok(())
}

fn print_out<T: serde::Serialize>(json: bool, value: &T, text: String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else if !text.is_empty() {
        println!("{}", text);
    }
    Ok(())
}
