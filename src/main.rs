//! # Triage Harness CLI (`triage`)
//!
//! The `triage` binary is the primary interface for Triage Harness. It
//! provides commands for database initialization, event ingestion,
//! querying, incident maintenance, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! triage --config ./config/triage.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `triage init` | Create the SQLite database and run schema migrations |
//! | `triage ingest --source <s> "<payload>"` | Ingest one event into the incident store |
//! | `triage event --source <s> "<payload>"` | Run the full event flow (score, correlate, recommend) |
//! | `triage ask "<question>"` | Ask the assistant as an operator |
//! | `triage search "<query>"` | Search similar past incidents |
//! | `triage resolve <event_id> "<note>"` | Record how an incident was resolved |
//! | `triage remove <event_id>` | Delete an incident from store and index |
//! | `triage rebuild` | Re-embed and re-index every stored incident |
//! | `triage status` | Show store/index counts and backend info |
//! | `triage serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use triage_harness::config;
use triage_harness::migrate;
use triage_harness::models::OperatorMessage;
use triage_harness::pipeline::{event_from_parts, Assistant};
use triage_harness::server;

/// Triage Harness CLI — an evidence-grounded incident triage assistant
/// for operations teams.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/triage.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "triage",
    about = "Triage Harness — an evidence-grounded incident triage assistant for operations teams",
    version,
    long_about = "Triage Harness ingests network and security events, scores them for anomaly \
    risk, retrieves semantically similar historical incidents, and generates remediation \
    recommendations grounded in that evidence, delivered via CLI, HTTP, or a chat channel."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/triage.toml")]
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
    /// (incidents, incident_vectors). Idempotent.
    Init,

    /// Ingest one event into the incident store.
    ///
    /// Duplicate events (same derived or explicit event id) are no-ops.
    Ingest {
        /// Event payload text.
        payload: String,

        /// Originating system (e.g. `ids`, `netflow`, `k8s`).
        #[arg(long, default_value = "manual")]
        source: String,

        /// Explicit event id; derived from content when omitted.
        #[arg(long)]
        event_id: Option<String>,

        /// Severity annotation stored in metadata.
        #[arg(long)]
        severity: Option<String>,
    },

    /// Run the full event flow: score, optionally auto-ingest, correlate
    /// against history, generate a recommendation, and deliver it.
    Event {
        /// Event payload text.
        payload: String,

        /// Originating system.
        #[arg(long, default_value = "manual")]
        source: String,

        /// Explicit event id; derived from content when omitted.
        #[arg(long)]
        event_id: Option<String>,
    },

    /// Ask the assistant a free-text question, as an operator would in chat.
    Ask {
        /// The question text.
        text: String,
    },

    /// Search similar past incidents.
    Search {
        /// The search query string.
        query: String,

        /// Only return incidents with this severity annotation.
        #[arg(long)]
        severity: Option<String>,
    },

    /// Record how an incident was resolved.
    ///
    /// The note becomes `resolution` metadata and is cited in future
    /// recommendations that retrieve this incident.
    Resolve {
        /// Incident event id.
        event_id: String,
        /// Resolution note.
        note: String,
    },

    /// Delete an incident from both store and index.
    Remove {
        /// Incident event id.
        event_id: String,
    },

    /// Re-embed and re-index every stored incident.
    ///
    /// Recovery path after vector corruption or an embedding model change.
    Rebuild,

    /// Show store/index counts and configured backends.
    Status,

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and exposes `/events`, `/chat`, `/status`,
    /// and `/health`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = triage_harness::db::connect(&cfg.db.path).await?;
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let (assistant, report) = Assistant::initialize(cfg).await?;
    if !report.is_consistent() {
        eprintln!(
            "warning: store/index inconsistency ({} incidents without vectors, {} orphaned vectors); run `triage rebuild`",
            report.missing_vectors.len(),
            report.orphaned_vectors.len()
        );
    }

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Ingest {
            payload,
            source,
            event_id,
            severity,
        } => {
            let event = event_from_parts(&source, &payload, event_id);
            let mut metadata = std::collections::HashMap::new();
            if let Some(severity) = severity {
                metadata.insert("severity".to_string(), severity);
            }
            let (event_id, created) = assistant.ingest(&event, &metadata).await?;
            if created {
                println!("Ingested {}", event_id);
            } else {
                println!("Already present: {}", event_id);
            }
        }
        Commands::Event {
            payload,
            source,
            event_id,
        } => {
            let event = event_from_parts(&source, &payload, event_id);
            let report = assistant.handle_event(&event).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Ask { text } => {
            let reply = assistant
                .handle_message(&OperatorMessage {
                    text,
                    sender: "cli".to_string(),
                    channel: "cli".to_string(),
                })
                .await?;
            println!("{}", reply.text);
            if !reply.provenance.is_empty() {
                println!("(evidence: {})", reply.provenance.join(", "));
            }
        }
        Commands::Search { query, severity } => {
            let result = assistant.search(&query, severity).await?;
            if result.hits.is_empty() {
                println!("No matching incidents.");
            }
            for hit in &result.hits {
                println!(
                    "[{}] {:.3}  {}",
                    hit.record.event_id, hit.similarity, hit.record.raw_text
                );
            }
        }
        Commands::Resolve { event_id, note } => {
            assistant.log_resolution(&event_id, &note).await?;
            println!("Recorded resolution for {}", event_id);
        }
        Commands::Remove { event_id } => {
            assistant.remove(&event_id).await?;
            println!("Removed {}", event_id);
        }
        Commands::Rebuild => {
            let count = assistant.rebuild().await?;
            println!("Re-indexed {} incident(s).", count);
        }
        Commands::Status => {
            let status = assistant.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Serve => {
            server::run_server(Arc::new(assistant)).await?;
        }
    }

    Ok(())
}
