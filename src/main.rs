//! # docpipe CLI
//!
//! The `docpipe` binary drives the document ingestion pipeline. It provides
//! commands for database initialization, job submission, progress polling,
//! cancellation, deletion, page previews, and running the background worker.
//!
//! ## Usage
//!
//! ```bash
//! docpipe --config ./config/docpipe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docpipe init` | Create the SQLite database and run schema migrations |
//! | `docpipe submit <source>` | Enqueue an ingestion job for a file or directory |
//! | `docpipe status <job-id>` | Show a job with its per-file step events |
//! | `docpipe jobs` | List recent jobs |
//! | `docpipe cancel <job-id>` | Request cancellation at the next file boundary |
//! | `docpipe delete <job-id>` | Remove a job, its documents, chunks, and events |
//! | `docpipe preview <document-id> <page>` | Write a cached page render to a file |
//! | `docpipe worker` | Process pending jobs (poll loop, or `--once` to drain) |

mod cache;
mod chunker;
mod citation;
mod config;
mod db;
mod embedder;
mod error;
mod migrate;
mod models;
mod parser;
mod pipeline;
mod repo;
mod service;
mod worker;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// docpipe — a document ingestion pipeline for retrieval-augmented AI
/// systems.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docpipe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docpipe",
    about = "docpipe — document ingestion pipeline for retrieval-augmented AI systems",
    version,
    long_about = "docpipe turns source files (PDF, markdown, plain text, JSON) into pages, \
    overlapping chunks, embedding vectors, and citations, tracking per-file step progress \
    through a job/event state machine backed by SQLite."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docpipe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (collections,
    /// ingestion_jobs, documents, chunks, ingestion_events). Idempotent.
    Init,

    /// Enqueue an ingestion job for a file or directory.
    ///
    /// Validates chunking parameters before the job is created; a directory
    /// source is walked recursively through the configured include/exclude
    /// globs when the job runs.
    Submit {
        /// File or directory to ingest.
        source: String,

        /// Target collection name.
        #[arg(long, default_value = "default")]
        collection: String,

        /// Window size in characters (defaults from config).
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Characters shared between consecutive windows (defaults from config).
        #[arg(long)]
        chunk_overlap: Option<usize>,

        /// Process the job immediately instead of leaving it for a worker.
        #[arg(long)]
        now: bool,
    },

    /// Show a job with its per-file step events.
    Status {
        /// Job id as printed by `submit`.
        job_id: String,
    },

    /// List recent jobs.
    Jobs {
        /// Maximum number of jobs to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Request cancellation of a pending or running job.
    ///
    /// Files already being processed complete; queued files are skipped and
    /// the job finalizes as failed with a cancellation message.
    Cancel { job_id: String },

    /// Delete a job with its documents, chunks, and events.
    ///
    /// The content cache is untouched: entries are keyed by file content and
    /// shared across jobs.
    Delete { job_id: String },

    /// Write a cached page render to a file.
    Preview {
        document_id: String,
        page: i64,
        /// Output path; defaults to `page-<n>.<ext>` in the working directory.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Process pending jobs.
    Worker {
        /// Drain the queue and exit instead of polling forever.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docpipe=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            std::fs::create_dir_all(&cfg.storage.cache_dir)?;
            println!("initialized {}", cfg.db.path.display());
            pool.close().await;
        }
        Commands::Submit {
            source,
            collection,
            chunk_size,
            chunk_overlap,
            now,
        } => {
            service::run_submit(&cfg, source, collection, chunk_size, chunk_overlap, now).await?;
        }
        Commands::Status { job_id } => {
            service::run_status(&cfg, &job_id).await?;
        }
        Commands::Jobs { limit } => {
            service::run_jobs(&cfg, limit).await?;
        }
        Commands::Cancel { job_id } => {
            service::run_cancel(&cfg, &job_id).await?;
        }
        Commands::Delete { job_id } => {
            service::run_delete(&cfg, &job_id).await?;
        }
        Commands::Preview {
            document_id,
            page,
            output,
        } => {
            service::run_preview(&cfg, &document_id, page, output).await?;
        }
        Commands::Worker { once } => {
            worker::run_worker(&cfg, once).await?;
        }
    }

    Ok(())
}
