//! # DocChat CLI (`docchat`)
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and run schema migrations |
//! | `docchat ingest <file> --owner <id>` | Upload and index a document |
//! | `docchat status <id>` | Show a document's processing state |
//! | `docchat retry <id>` | Re-run a failed document |
//! | `docchat documents --owner <id>` | List a user's documents |
//! | `docchat session new --owner <id>` | Start a chat session |
//! | `docchat chat <session> --owner <id> "<text>"` | Submit one message |
//! | `docchat quota balance\|open\|adjust` | Inspect and manage token quotas |
//! | `docchat serve` | Start the HTTP server |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); command output goes to
//! stdout.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use docchat::app::App;
use docchat::chat::TurnOptions;
use docchat::config;
use docchat::{db, migrate, server};
use docchat_core::models::DocumentFormat;
use tracing_subscriber::EnvFilter;

/// DocChat: chat with your documents under a per-user token quota.
#[derive(Parser)]
#[command(name = "docchat", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Upload a file and run it through chunking, embedding, and indexing.
    Ingest {
        file: PathBuf,

        /// Owning user id.
        #[arg(long)]
        owner: String,

        /// Source format (`txt`, `md`, `csv`, `json`, `pdf`, `docx`).
        /// Defaults to the file extension.
        #[arg(long)]
        format: Option<String>,
    },

    /// Show a document's status.
    Status { id: String },

    /// Re-run a failed document from its stored source.
    Retry { id: String },

    /// List a user's documents, newest first.
    Documents {
        #[arg(long)]
        owner: String,
    },

    /// Manage chat sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Send one message to a session and print the reply.
    Chat {
        session: String,

        text: String,

        #[arg(long)]
        owner: String,

        /// Answer without retrieving document context.
        #[arg(long)]
        no_rag: bool,

        /// Passages to retrieve (defaults to `[retrieval].k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Inspect and manage token quotas.
    Quota {
        #[command(subcommand)]
        action: QuotaAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Print shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a session and print its id.
    New {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        system_prompt: Option<String>,
    },

    /// Print a session's turns.
    History {
        session: String,

        #[arg(long)]
        owner: String,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum QuotaAction {
    /// Show allocated, consumed, and remaining tokens.
    Balance { user: String },

    /// Open an account (no-op if it exists).
    Open {
        user: String,

        /// Defaults to `[quota].default_allocation`.
        #[arg(long)]
        allocated: Option<i64>,
    },

    /// Change a user's allocation by `delta` tokens.
    Adjust {
        user: String,

        #[arg(allow_hyphen_values = true)]
        delta: i64,

        #[arg(long)]
        admin: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Print recent usage entries and check the ledger for drift.
    Usage {
        user: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "docchat", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            owner,
            format,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            let format = match format {
                Some(f) => f.parse::<DocumentFormat>()?,
                None => DocumentFormat::from_filename(&filename)?,
            };
            let app = App::from_config(cfg).await?;
            let doc = app.documents.ingest(bytes, format, &filename, &owner).await?;
            print_document(&doc);
        }
        Commands::Status { id } => {
            let app = App::from_config(cfg).await?;
            print_document(&app.documents.status(&id).await?);
        }
        Commands::Retry { id } => {
            let app = App::from_config(cfg).await?;
            print_document(&app.documents.retry(&id).await?);
        }
        Commands::Documents { owner } => {
            let app = App::from_config(cfg).await?;
            let docs = app.documents.list(&owner).await?;
            if docs.is_empty() {
                println!("No documents.");
            }
            for doc in docs {
                println!(
                    "{}  {:<10} {:>5} chunks  {}",
                    doc.id, doc.status.as_str(), doc.chunk_count, doc.filename
                );
            }
        }
        Commands::Session { action } => {
            let app = App::from_config(cfg).await?;
            match action {
                SessionAction::New {
                    owner,
                    title,
                    system_prompt,
                } => {
                    let session = app
                        .chat
                        .create_session(&owner, title.as_deref(), system_prompt.as_deref())
                        .await?;
                    println!("{}", session.id);
                }
                SessionAction::History {
                    session,
                    owner,
                    limit,
                } => {
                    for turn in app.chat.history(&session, &owner, limit, 0).await? {
                        println!("[{}] {}: {}", turn.seq, turn.role.as_str(), turn.text);
                    }
                }
            }
        }
        Commands::Chat {
            session,
            text,
            owner,
            no_rag,
            k,
        } => {
            let app = App::from_config(cfg).await?;
            let options = TurnOptions {
                use_rag: !no_rag,
                system_prompt: None,
                k,
            };
            let reply = app.chat.submit_turn(&session, &owner, &text, options).await?;
            println!("{}", reply.reply);
            println!();
            println!(
                "tokens billed: {}  remaining: {}  context chunks: {}",
                reply.tokens_billed,
                reply.remaining,
                reply.context_chunk_ids.len()
            );
        }
        Commands::Quota { action } => {
            let app = App::from_config(cfg).await?;
            match action {
                QuotaAction::Balance { user } => {
                    let b = app.ledger.balance(&user).await?;
                    println!(
                        "user: {}\nallocated: {}\nconsumed: {}\nremaining: {}",
                        b.user_id, b.allocated, b.consumed, b.remaining
                    );
                }
                QuotaAction::Open { user, allocated } => {
                    if app.ledger.open_account(&user, allocated).await? {
                        println!("Opened quota account for {}.", user);
                    } else {
                        println!("Quota account for {} already exists.", user);
                    }
                }
                QuotaAction::Adjust {
                    user,
                    delta,
                    admin,
                    reason,
                } => {
                    let b = app
                        .ledger
                        .adjust_allocation(&user, delta, &admin, reason.as_deref())
                        .await?;
                    println!("allocated: {}  remaining: {}", b.allocated, b.remaining);
                }
                QuotaAction::Usage { user, limit } => {
                    for entry in app.ledger.usage(&user, limit).await? {
                        println!(
                            "{}  {:<16} {:>8}  {}",
                            entry.created_at,
                            entry.operation.as_str(),
                            entry.tokens,
                            entry.detail.unwrap_or_default()
                        );
                    }
                    let audit = app.ledger.audit(&user).await?;
                    if audit.is_consistent() {
                        println!("ledger consistent ({} outstanding)", audit.outstanding);
                    } else {
                        println!(
                            "ledger drift: consumed {} but reservations add up to {}",
                            audit.consumed, audit.expected
                        );
                    }
                }
            }
        }
        Commands::Serve => {
            let app = App::from_config(cfg).await?;
            let recovered = app
                .documents
                .recover_interrupted()
                .await
                .context("Failed to recover interrupted documents")?;
            if recovered > 0 {
                tracing::warn!(recovered, "failed documents left mid-pipeline by a previous run");
            }
            server::run_server(app).await?;
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}

fn print_document(doc: &docchat_core::models::Document) {
    println!("id: {}", doc.id);
    println!("filename: {}", doc.filename);
    println!("status: {}", doc.status);
    println!("chunks: {}", doc.chunk_count);
    if let Some(err) = &doc.last_error {
        println!("error: {}", err);
    }
}
