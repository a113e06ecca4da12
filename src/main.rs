//! # RAG Lifecycle CLI (`ragctl`)
//!
//! Registers documents, builds and queries their indexes, and inspects and
//! repairs index health.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragctl init` | Write a default config if missing; create database and storage |
//! | `ragctl add <path>` | Register a document |
//! | `ragctl build <id>` | Build (or reuse) a document's index |
//! | `ragctl rebuild <id>` | Rebuild from source |
//! | `ragctl query <id> "<text>"` | Ask a question against a document |
//! | `ragctl status <id>` | Show index status |
//! | `ragctl recover <id>` | Analyze and repair an index |
//! | `ragctl health` | Health of every index |
//! | `ragctl cache stats` / `cache clear` | Response cache administration |
//! | `ragctl delete <id>` | Remove a document and its index |
//! | `ragctl cleanup` | Remove orphaned index directories |

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rag_lifecycle::commands;
use rag_lifecycle::config::load_config;
use rag_lifecycle::logging::init_logging;
use rag_lifecycle_core::models::{DocumentId, QueryParams};

/// RAG Lifecycle: per-document vector indexes with managed builds,
/// generation swaps, corruption repair, and cached answers.
#[derive(Parser)]
#[command(name = "ragctl", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragctl.toml")]
    config: PathBuf,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration, database, and index storage.
    ///
    /// Writes a default config to `--config` when none exists. Idempotent.
    Init {
        /// Directory for the database and indexes in a new config.
        #[arg(long, default_value = "./data")]
        root: PathBuf,
    },

    /// Register a document file.
    Add {
        path: PathBuf,
        #[arg(long)]
        title: Option<String>,
    },

    /// Build a document's index.
    ///
    /// An up-to-date index, or an index of identical content, is reused
    /// unless `--overwrite` is given.
    Build {
        id: DocumentId,
        #[arg(long)]
        overwrite: bool,
    },

    /// Rebuild a document's index from source.
    Rebuild { id: DocumentId },

    /// Ask a question against a document's index.
    Query {
        id: DocumentId,
        text: String,
        /// Number of chunks to retrieve (defaults to `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,
        /// Drop chunks scoring below this similarity.
        #[arg(long)]
        min_score: Option<f32>,
    },

    /// Show the status of a document's index.
    Status { id: DocumentId },

    /// Analyze a document's index and repair any damage.
    Recover {
        id: DocumentId,
        /// Rebuild from source regardless of the analysis.
        #[arg(long)]
        force_rebuild: bool,
    },

    /// Check the health of every index.
    Health,

    /// Response cache administration.
    ///
    /// The cache lives in memory and only for the lifetime of one process.
    /// Each `ragctl` invocation starts with an empty cache, so these
    /// commands report on and clear the cache of this process only.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Delete a document and its index.
    Delete { id: DocumentId },

    /// Remove index directories no record references.
    Cleanup,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache counters of this process (always empty from the CLI).
    Stats,
    /// Drop cached answers held by this process.
    Clear {
        /// Only answers for this document.
        #[arg(long)]
        document: Option<DocumentId>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Init { root } = &cli.command {
        return commands::run_init(&cli.config, root).await;
    }

    let cfg = load_config(&cli.config)?;
    let json = cli.json;

    match cli.command {
        // Handled before config loading.
        Commands::Init { .. } => {}
        Commands::Add { path, title } => {
            commands::run_add(&cfg, &path, title.as_deref(), json).await?;
        }
        Commands::Build { id, overwrite } => {
            commands::run_build(&cfg, id, overwrite, json).await?;
        }
        Commands::Rebuild { id } => {
            commands::run_build(&cfg, id, true, json).await?;
        }
        Commands::Query {
            id,
            text,
            top_k,
            min_score,
        } => {
            let params = QueryParams { top_k, min_score };
            commands::run_query(&cfg, id, &text, params, json).await?;
        }
        Commands::Status { id } => {
            commands::run_status(&cfg, id, json).await?;
        }
        Commands::Recover { id, force_rebuild } => {
            commands::run_recover(&cfg, id, force_rebuild, json).await?;
        }
        Commands::Health => {
            commands::run_health(&cfg, json).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats => commands::run_cache_stats(&cfg, json).await?,
            CacheAction::Clear { document } => commands::run_cache_clear(&cfg, document).await?,
        },
        Commands::Delete { id } => {
            commands::run_delete(&cfg, id).await?;
        }
        Commands::Cleanup => {
            commands::run_cleanup(&cfg).await?;
        }
    }

    Ok(())
}
