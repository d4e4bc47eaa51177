//! # Dochive CLI (`dochive`)
//!
//! The `dochive` binary drives the retrieval pipeline from the command
//! line: database initialization, file ingestion and deletion, question
//! answering, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! dochive --config ./config/dochive.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dochive init` | Create the SQLite database and the vector collection |
//! | `dochive ingest <path>` | Ingest a file or directory of documents |
//! | `dochive files` | List ingested files |
//! | `dochive delete <name>` | Delete a file from every store |
//! | `dochive query "<question>"` | Answer a question, streaming tokens |
//! | `dochive serve` | Start the HTTP API server |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use dochive::config;
use dochive::db;
use dochive::docstore::Docstore;
use dochive::loader;
use dochive::pipeline::{Answer, Pipeline, QueryOptions};
use dochive::server;

/// Dochive — hybrid parent/child retrieval over document collections.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dochive.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dochive",
    about = "Dochive — hybrid parent/child retrieval over document collections",
    version,
    long_about = "Dochive ingests documents into a two-level chunk hierarchy, indexes child \
    chunks with dense and sparse vectors for hybrid search, and answers questions against the \
    indexed corpus with reranking, a relevance gate, and a semantic response cache."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dochive.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and the vector collection.
    ///
    /// Idempotent — running it multiple times is safe.
    Init,

    /// Ingest a file, or every supported file under a directory.
    ///
    /// Re-ingesting a file with the same name replaces its chunks.
    Ingest {
        /// File or directory to ingest (.txt, .md, .pdf).
        path: PathBuf,
    },

    /// List ingested files.
    Files,

    /// Delete a file from the relational store, the vector index, and
    /// object storage.
    Delete {
        /// File name as shown by `dochive files`.
        name: String,
    },

    /// Answer a question against the indexed corpus.
    ///
    /// Tokens are streamed to stdout as they are generated.
    Query {
        /// The question to answer.
        question: String,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dochive=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let pool = db::connect(&cfg).await?;
    db::run_migrations(&pool).await?;
    let docstore = Arc::new(Docstore::new(pool));

    match cli.command {
        Commands::Init => {
            let pipeline = Pipeline::from_config(cfg, docstore)?;
            pipeline.ensure_ready().await?;
            println!("Database and collection initialized.");
        }
        Commands::Ingest { path } => {
            let docs = loader::load_path(&path)?;
            let pipeline = Pipeline::from_config(cfg, docstore)?;
            pipeline.ensure_ready().await?;
            let stats = pipeline.ingest_documents(&docs).await?;
            println!(
                "Ingested {} file(s): {} parent chunks, {} child chunks.",
                stats.files, stats.parents, stats.children
            );
        }
        Commands::Files => {
            let files = docstore.list_files().await?;
            if files.is_empty() {
                println!("No files ingested.");
            }
            for file in files {
                println!("{}  (collection: {})", file.name, file.collection);
            }
        }
        Commands::Delete { name } => {
            let pipeline = Pipeline::from_config(cfg, docstore)?;
            if pipeline.delete_file(&name).await? {
                println!("Deleted {}.", name);
            } else {
                anyhow::bail!("no file named: {}", name);
            }
        }
        Commands::Query { question } => {
            let pipeline = Pipeline::from_config(cfg, docstore)?;
            run_query(&pipeline, &question).await?;
        }
        Commands::Serve => {
            let bind = cfg.server.bind.clone();
            let pipeline = Arc::new(Pipeline::from_config(cfg, docstore)?);
            server::run_server(&bind, pipeline).await?;
        }
    }

    Ok(())
}

async fn run_query(pipeline: &Pipeline, question: &str) -> Result<()> {
    match pipeline.answer(question, &QueryOptions::default()).await? {
        Answer::Cached(text) | Answer::Deflected(text) => {
            println!("{}", text);
        }
        Answer::Stream(mut rx) => {
            let mut stdout = tokio::io::stdout();
            while let Some(token) = rx.recv().await {
                stdout.write_all(token?.as_bytes()).await?;
                stdout.flush().await?;
            }
            stdout.write_all(b"\n").await?;
        }
    }
    Ok(())
}
