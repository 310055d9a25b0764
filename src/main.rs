//! # Chat Recall CLI (`recall`)
//!
//! The `recall` binary is the primary interface for Chat Recall. It provides
//! commands for database initialization, probing chat-history stores,
//! syncing them into the vector index, and searching past conversations.
//!
//! ## Usage
//!
//! ```bash
//! recall --config ./config/recall.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recall init` | Create the index database and run schema migrations |
//! | `recall probe` | Detect the storage layout of every configured source store |
//! | `recall sync` | Index new messages since the checkpoint, or a date range |
//! | `recall search "<query>"` | Similarity search with surrounding conversation context |
//! | `recall checkpoint` | Show the stored sync checkpoint |
//! | `recall stats` | Index totals and per-workspace breakdown |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! recall init --config ./config/recall.toml
//!
//! # Incremental sync from the checkpoint
//! recall sync
//!
//! # Re-index one week of a single workspace
//! recall sync --from 2024-03-01 --to 2024-03-07 --workspace api-server
//!
//! # Search with two messages of context on each side
//! recall search "retry backoff for the uploader" --context 2
//! ```

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use chat_recall::checkpoint;
use chat_recall::config;
use chat_recall::ingest::{self, SyncOptions};
use chat_recall::migrate;
use chat_recall::progress::ProgressMode;
use chat_recall::search::{self, SearchOptions};
use chat_recall::source::SourceExtractor;
use chat_recall::stats;

/// Chat Recall: semantic search over local AI chat history.
#[derive(Parser)]
#[command(name = "recall", version, about = "Chat Recall: semantic search over local AI chat history")]
struct Cli {
    /// Path to configuration file.
    #[arg(long, global = true, default_value = "./config/recall.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is unset (e.g. `debug`, `chat_recall=trace`).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database (create tables and run migrations).
    Init,

    /// Probe every configured source store and report its layout.
    ///
    /// Exits with an error if a store's layout is not recognized; a
    /// `schema-health-<workspace>.json` report is written to the
    /// diagnostics directory for each such store.
    Probe,

    /// Extract, normalize, embed and index chat messages.
    ///
    /// Without `--from`/`--to`, syncs everything newer than the stored
    /// checkpoint (minus the configured overlap) and advances the
    /// checkpoint. With a date range, re-processes exactly those days and
    /// leaves the checkpoint alone.
    Sync {
        /// First day to sync (YYYY-MM-DD, UTC). Defaults to `--to`.
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day to sync (YYYY-MM-DD, UTC). Defaults to today.
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Only sync the store with this workspace label. Requires a range.
        #[arg(long)]
        workspace: Option<String>,

        /// Ignore the checkpoint and start from the initial lookback window.
        #[arg(long)]
        full: bool,

        /// Probe and extract, print counts, but do not embed or write.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to `human` on a TTY, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Search indexed messages by similarity.
    Search {
        /// The search query text.
        query: String,

        /// Restrict results to one workspace label.
        #[arg(long)]
        workspace: Option<String>,

        /// Only messages on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only messages on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Drop results below this cosine similarity.
        #[arg(long)]
        min_similarity: Option<f32>,

        /// Messages of surrounding context to show before and after each hit.
        #[arg(long)]
        context: Option<usize>,
    },

    /// Show the stored sync checkpoint.
    Checkpoint,

    /// Show index totals and a per-workspace breakdown.
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Probe => {
            let extractor = SourceExtractor::connect(&cfg.source)
                .await
                .context("Failed to open source stores")?;
            for (workspace, report) in extractor.reports() {
                let viable: Vec<&str> = report.viable_strategies.iter().map(|v| v.as_str()).collect();
                println!(
                    "{:<24} {:<8} schema={} viable=[{}]",
                    workspace,
                    if report.is_healthy { "OK" } else { "UNKNOWN" },
                    report.schema_version,
                    viable.join(", ")
                );
                for issue in &report.issues {
                    println!("    - {}", issue);
                }
            }
            let health = extractor.check_health();
            extractor.close().await;
            health?;
        }
        Commands::Sync {
            from,
            to,
            workspace,
            full,
            dry_run,
            progress,
        } => {
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let opts = SyncOptions {
                from,
                to,
                workspace,
                full,
                dry_run,
            };
            tokio::select! {
                result = ingest::run_sync(&cfg, opts, mode.reporter()) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("sync interrupted; messages indexed so far are kept, checkpoint unchanged");
                    std::process::exit(130);
                }
            }
        }
        Commands::Search {
            query,
            workspace,
            since,
            until,
            top_k,
            min_similarity,
            context,
        } => {
            let opts = SearchOptions {
                workspace,
                since,
                until,
                top_k,
                min_similarity,
                context,
            };
            search::run_search(&cfg, &query, opts).await?;
        }
        Commands::Checkpoint => {
            checkpoint::show_checkpoint(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
