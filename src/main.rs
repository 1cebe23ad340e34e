//! # Ragline CLI (`ragline`)
//!
//! The `ragline` binary drives the retrieval-augmented chat backend from
//! the command line: database initialization, document ingestion and
//! removal, job inspection, retrieval-grounded questions, and the HTTP
//! server.
//!
//! ## Usage
//!
//! ```bash
//! ragline --config ./config/ragline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline init` | Create the SQLite database and run schema migrations |
//! | `ragline ingest <path>` | Register a text file and index it for retrieval |
//! | `ragline delete <id>` | Remove a document and its vectors |
//! | `ragline ask "<question>"` | Stream a retrieval-grounded answer |
//! | `ragline jobs` | List ingestion jobs |
//! | `ragline serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! ragline init --config ./config/ragline.toml
//!
//! # Ingest a file for a user
//! ragline ingest ./notes.md --owner alice
//!
//! # Scope a document to one conversation
//! ragline ingest ./meeting.txt --owner alice --conversation conv-42
//!
//! # Ask a question grounded in alice's documents
//! ragline ask "what deadlines did my notes mention?" --owner alice
//!
//! # Inspect the ingestion queue
//! ragline jobs --state failed
//!
//! # Start the HTTP server
//! ragline serve --config ./config/ragline.toml
//! ```

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ragline::config::{self, Config};
use ragline::context::assemble_context;
use ragline::ingest::IngestPipeline;
use ragline::models::{JobState, NewDocument, StreamEvent};
use ragline::queue::{self, EnqueueOutcome, IngestQueue, JobExecutor};
use ragline::relay;
use ragline::retrieve::Retriever;
use ragline::store::{ScopeFilter, VectorStore};
use ragline::{db, migrate, server};

/// Ragline CLI — a retrieval-augmented chat backend over SQLite.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragline.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ragline",
    about = "Ragline — a retrieval-augmented chat backend over SQLite",
    version,
    long_about = "Ragline ingests documents into chunked, embedded, scoped vectors in SQLite \
    and answers chat questions with streaming completions grounded in the most similar chunks."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ragline.toml`. Database, chunking, embedding,
    /// completion, queue, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, chunk_vectors, jobs). Idempotent.
    Init,

    /// Register a text file and index it for retrieval.
    ///
    /// Reads the file, registers it as a document, then chunks, embeds,
    /// and stores it. Runs synchronously by default; `--queue` enqueues
    /// the work for a running `ragline serve` process instead.
    Ingest {
        /// Path to a UTF-8 text file.
        path: PathBuf,

        /// Owner scope for the document (required).
        #[arg(long)]
        owner: String,

        /// Optional conversation scope.
        #[arg(long)]
        conversation: Option<String>,

        /// Override the stored file name (defaults to the path's file name).
        #[arg(long)]
        file_name: Option<String>,

        /// MIME content type recorded with the document.
        #[arg(long, default_value = "text/plain")]
        content_type: String,

        /// Enqueue a durable job instead of ingesting synchronously.
        /// Requires a running `ragline serve` sharing the same database.
        #[arg(long)]
        queue: bool,
    },

    /// Remove a document, its chunks, and its vectors.
    Delete {
        /// Document UUID.
        id: String,
    },

    /// Ask a question and stream a retrieval-grounded answer to stdout.
    Ask {
        /// The question to answer.
        question: String,

        /// Owner scope for retrieval (required).
        #[arg(long)]
        owner: String,

        /// Optional conversation scope.
        #[arg(long)]
        conversation: Option<String>,

        /// Maximum number of chunks to retrieve.
        #[arg(long, short = 'k')]
        limit: Option<usize>,
    },

    /// List ingestion jobs, newest first.
    Jobs {
        /// Filter by state: `queued`, `active`, `completed`, or `failed`.
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of jobs to show.
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind`, spawns the
    /// ingestion worker pool, and serves the document, job, and chat
    /// endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            owner,
            conversation,
            file_name,
            content_type,
            queue,
        } => {
            run_ingest(&cfg, &path, owner, conversation, file_name, content_type, queue).await?;
        }
        Commands::Delete { id } => {
            run_delete(&cfg, &id).await?;
        }
        Commands::Ask {
            question,
            owner,
            conversation,
            limit,
        } => {
            run_ask(&cfg, &question, owner, conversation, limit).await?;
        }
        Commands::Jobs { state, limit } => {
            run_jobs(&cfg, state, limit).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn build_pipeline(cfg: &Config, pool: &sqlx::SqlitePool) -> Arc<IngestPipeline> {
    let store = Arc::new(VectorStore::new(pool.clone()));
    Arc::new(IngestPipeline::new(
        pool.clone(),
        store,
        Arc::new(cfg.clone()),
    ))
}

async fn run_ingest(
    cfg: &Config,
    path: &PathBuf,
    owner: String,
    conversation: Option<String>,
    file_name: Option<String>,
    content_type: String,
    queue: bool,
) -> anyhow::Result<()> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = file_name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string())
    });

    let pool = db::connect(cfg).await?;
    let pipeline = build_pipeline(cfg, &pool);

    let doc = pipeline
        .register_document(NewDocument {
            owner_id: owner,
            conversation_id: conversation,
            file_name,
            content_type,
            body,
        })
        .await?;

    if queue {
        let q = IngestQueue::new(
            pool.clone(),
            cfg.queue.clone(),
            Arc::clone(&pipeline) as Arc<dyn JobExecutor>,
        );
        match q
            .enqueue(&doc.id, ragline::models::JobKind::Ingest, serde_json::json!({}))
            .await
        {
            EnqueueOutcome::Queued { job_id } => {
                println!("Registered document {}", doc.id);
                println!("Enqueued ingest job {} (run `ragline jobs` to track it)", job_id);
            }
            EnqueueOutcome::Inline { result } => {
                result?;
                println!("Registered and ingested document {} (queue unavailable, ran inline)", doc.id);
            }
        }
    } else {
        pipeline.ingest_document(&doc.id).await?;
        println!("Ingested document {} ({})", doc.id, doc.file_name);
    }

    Ok(())
}

async fn run_delete(cfg: &Config, id: &str) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let pipeline = build_pipeline(cfg, &pool);

    if ragline::ingest::fetch_document(&pool, id).await?.is_none() {
        bail!("no document with id: {}", id);
    }

    pipeline.delete_document(id).await?;
    println!("Deleted document {}", id);
    Ok(())
}

async fn run_ask(
    cfg: &Config,
    question: &str,
    owner: String,
    conversation: Option<String>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let store = Arc::new(VectorStore::new(pool.clone()));
    let retriever = Retriever::new(store, Arc::new(cfg.clone()));

    let filter = ScopeFilter {
        owner: Some(owner),
        conversation,
    };
    let k = limit.unwrap_or_else(|| retriever.default_k());
    let results = retriever.retrieve(question, &filter, k).await;
    if results.is_empty() {
        eprintln!("(no relevant context found; answering from the question alone)");
    } else {
        eprintln!("(grounding on {} retrieved chunks)", results.len());
    }

    let context_block = assemble_context(&results, cfg.retrieval.context_budget_chars);
    let messages = relay::build_messages(question, &context_block);
    let mut rx = relay::stream_completion(cfg.completion.clone(), messages);

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Delta(delta) => {
                stdout.write_all(delta.as_bytes())?;
                stdout.flush()?;
            }
            StreamEvent::Error(message) => {
                println!();
                bail!("completion failed: {}", message);
            }
            StreamEvent::Done => {
                println!();
                break;
            }
        }
    }

    Ok(())
}

async fn run_jobs(cfg: &Config, state: Option<String>, limit: i64) -> anyhow::Result<()> {
    let state = match state.as_deref() {
        Some(s) => Some(
            JobState::parse(s)
                .ok_or_else(|| anyhow::anyhow!("unknown job state: {} (expected queued, active, completed, or failed)", s))?,
        ),
        None => None,
    };

    let pool = db::connect(cfg).await?;
    let jobs = queue::list_jobs(&pool, state, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!("{:<36}  {:<8}  {:<9}  {:>8}  {}", "ID", "KIND", "STATE", "ATTEMPTS", "ERROR");
    for job in jobs {
        println!(
            "{:<36}  {:<8}  {:<9}  {:>8}  {}",
            job.id,
            job.kind.as_str(),
            job.state.as_str(),
            job.attempts,
            job.last_error.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}
