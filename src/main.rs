//! # PDF RAG CLI (`rag`)
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and run schema migrations |
//! | `rag ingest` | Load, split and index a user's PDFs |
//! | `rag ask "<question>"` | Answer a question from a user's PDFs |
//! | `rag queries list` | Recent queries, newest first |
//! | `rag queries get <id>` | One query record |
//! | `rag documents` | List a user's PDFs |
//! | `rag serve` | Start the HTTP server |
//!
//! Commands that take `--user` fall back to `[queries].default_user`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pdf_rag::config::{self, Config};
use pdf_rag::loader;
use pdf_rag::logging;
use pdf_rag::migrate;
use pdf_rag::pipeline::Pipeline;
use pdf_rag::server;
use pdf_rag_core::models::QueryRecord;

/// Question answering over per-user PDF collections.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "rag", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Index the user's documents. Unchanged chunks are skipped.
    Ingest {
        #[arg(long)]
        user: Option<String>,

        /// Delete the user's indexed chunks first and re-embed everything.
        #[arg(long)]
        reset: bool,
    },

    /// Ask a question and store the answered record.
    Ask {
        question: String,

        #[arg(long)]
        user: Option<String>,
    },

    /// Inspect stored query records.
    Queries {
        #[command(subcommand)]
        action: QueriesAction,
    },

    /// List the user's PDF documents.
    Documents {
        #[arg(long)]
        user: Option<String>,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum QueriesAction {
    /// Recent queries, newest first.
    List {
        #[arg(long)]
        user: Option<String>,

        /// Defaults to, and is capped at, `[queries].list_limit`.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one query record.
    Get {
        id: String,

        #[arg(long)]
        user: Option<String>,
    },
}

fn user_or_default(config: &Config, user: Option<String>) -> String {
    user.unwrap_or_else(|| config.queries.default_user.clone())
}

fn print_record(record: &QueryRecord) {
    let created = chrono::DateTime::from_timestamp(record.created_at, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| record.created_at.to_string());

    println!("id:       {}", record.query_id);
    println!("created:  {}", created);
    println!("question: {}", record.query_text);
    match record.answer_text {
        Some(ref answer) => println!("answer:   {}", answer),
        None => println!("answer:   (pending)"),
    }
    if !record.sources.is_empty() {
        println!("sources:");
        for source in &record.sources {
            println!("  {} (page {})", source.filename, source.page);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest { user, reset } => {
            let user = user_or_default(&cfg, user);
            let pipeline = Pipeline::from_config(cfg).await?;
            let summary = pipeline.ingest_user(&user, reset).await?;

            println!("ingest {}", summary.user_id);
            if summary.synced > 0 {
                println!("  synced from S3: {}", summary.synced);
            }
            if reset {
                println!("  cleared: {}", summary.cleared);
            }
            println!("  documents: {}", summary.documents);
            println!("  pages: {}", summary.pages);
            println!("  chunks: {}", summary.chunks);
            println!("  added: {}", summary.added);
            println!("  skipped: {}", summary.skipped);
        }
        Commands::Ask { question, user } => {
            let user = user_or_default(&cfg, user);
            let pipeline = Pipeline::from_config(cfg).await?;
            let record = pipeline.ask(&user, &question).await?;
            print_record(&record);
        }
        Commands::Queries { action } => match action {
            QueriesAction::List { user, limit } => {
                let user = user_or_default(&cfg, user);
                let pipeline = Pipeline::from_config(cfg).await?;
                let records = pipeline.list_queries(&user, limit).await?;
                if records.is_empty() {
                    println!("No queries for {}.", user);
                }
                for record in &records {
                    let status = if record.is_complete() { "done" } else { "pending" };
                    println!("{}  [{}]  {}", record.query_id, status, record.query_text);
                }
            }
            QueriesAction::Get { id, user } => {
                let user = user_or_default(&cfg, user);
                let pipeline = Pipeline::from_config(cfg).await?;
                match pipeline.get_query(&user, &id).await? {
                    Some(record) => print_record(&record),
                    None => anyhow::bail!("query not found: {}", id),
                }
            }
        },
        Commands::Documents { user } => {
            let user = user_or_default(&cfg, user);
            let docs = loader::list_documents(&cfg, &user)?;
            if docs.is_empty() {
                println!("No documents for {}.", user);
            }
            for doc in &docs {
                println!("{:>10}  {}  {}", doc.size_bytes, doc.modified_at, doc.filename);
            }
        }
        Commands::Serve => {
            let pipeline = Pipeline::from_config(cfg).await?;
            server::run_server(pipeline).await?;
        }
    }

    Ok(())
}
