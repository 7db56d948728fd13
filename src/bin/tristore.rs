use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use comfy_table::presets::NOTHING;
use comfy_table::{Attribute, Cell, Table};
use tracing_subscriber::EnvFilter;

use tristore::config::TristoreConfig;
use tristore::ledger::LedgerQuery;
use tristore::orchestrator::{BackupOutcome, RestoreMode, RestoreOutcome, RestoreRequest};
use tristore::retention::SweepReport;
use tristore::types::{BackupRecord, BackupStatus, RecordId, StoreKind};
use tristore::Tristore;

/// Every run succeeded
const EXIT_OK: u8 = 0;
/// At least one run failed
const EXIT_RUN_FAILED: u8 = 1;
/// Configuration or connection error
const EXIT_SETUP: u8 = 2;

#[derive(Parser)]
#[command(
    name = "tristore",
    version,
    about = "Backup and restore for vector, graph and relational stores",
    after_help = "\
Environment variables:
  RUST_LOG                  Log filter (overrides -v)
  TRISTORE_DATABASE_URL     Ledger PostgreSQL URL
  TRISTORE_ARTIFACT_DIR     Artifact directory (filesystem backend)
  TRISTORE_QDRANT_URL       Qdrant URL (enables vector backups)
  TRISTORE_NEO4J_URL        Neo4j HTTP URL (enables graph backups)
  TRISTORE_RELATIONAL_URL   PostgreSQL URL of the relational source"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "tristore.json")]
    config: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List backup records, newest first
    List {
        #[arg(short, long)]
        kind: Option<StoreKind>,

        #[arg(short, long)]
        status: Option<BackupStatus>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Back up one store kind, or all configured kinds
    Backup {
        #[arg(short, long, required_unless_present = "all", conflicts_with = "all")]
        kind: Option<StoreKind>,

        #[arg(long)]
        all: bool,
    },

    /// Restore the latest (or a specific) backup
    Restore {
        #[arg(short, long, required_unless_present = "all", conflicts_with = "all")]
        kind: Option<StoreKind>,

        /// Restore this record instead of the latest
        #[arg(long, requires = "kind")]
        id: Option<RecordId>,

        #[arg(long)]
        all: bool,

        /// Resolve, download and verify without writing to the store
        #[arg(long)]
        validate_only: bool,

        /// Skip the post-restore fingerprint comparison
        #[arg(long)]
        no_verify: bool,
    },

    /// Apply retention policies and remove orphaned artifacts
    Sweep,

    /// Mark a stuck in-flight backup failed
    Abandon {
        #[arg(long)]
        id: RecordId,

        #[arg(long, default_value = "operator request")]
        reason: String,
    },

    /// Print metrics in the Prometheus text format
    Metrics,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if matches!(cli.command, Commands::Metrics) {
        print!("{}", tristore::metrics::gather());
        return ExitCode::from(EXIT_OK);
    }

    let tristore = match connect(&cli).await {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    let code = match cli.command {
        Commands::List { kind, status, limit } => {
            let mut query = LedgerQuery::all();
            query.store_kind = kind;
            query.status = status;
            query.limit = limit;
            match tristore.list_backups(&query).await {
                Ok(records) => {
                    print_records(&records);
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    EXIT_RUN_FAILED
                }
            }
        }
        Commands::Backup { kind, all } => {
            let outcomes = match (all, kind) {
                (false, Some(kind)) => vec![tristore.backup(kind).await],
                _ => tristore.backup_all().await,
            };
            print_backup_outcomes(&outcomes);
            exit_for(outcomes.iter().all(BackupOutcome::is_success))
        }
        Commands::Restore {
            kind,
            id,
            all,
            validate_only,
            no_verify,
        } => {
            let mode = if validate_only {
                RestoreMode::ValidateOnly
            } else {
                RestoreMode::Apply
            };
            let outcomes = match (all, kind, id) {
                (false, Some(kind), Some(id)) => {
                    vec![tristore.restore(RestoreRequest::explicit(kind, id).mode(mode).verify_after(!no_verify)).await]
                }
                (false, Some(kind), None) => {
                    vec![tristore.restore(RestoreRequest::latest(kind).mode(mode).verify_after(!no_verify)).await]
                }
                _ => tristore.with_verify_after_restore(!no_verify).restore_all(mode).await,
            };
            print_restore_outcomes(&outcomes);
            exit_for(outcomes.iter().all(RestoreOutcome::is_success))
        }
        Commands::Sweep => {
            let report = tristore.sweep().await;
            print_sweep(&report);
            exit_for(report.is_clean())
        }
        Commands::Abandon { id, reason } => match tristore.abandon(id, &reason).await {
            Ok(record) => {
                println!("{} {} {}", record.id, record.store_kind, record.status);
                EXIT_OK
            }
            Err(e) => {
                eprintln!("Error: {e}");
                EXIT_RUN_FAILED
            }
        },
        Commands::Metrics => EXIT_OK,
    };

    ExitCode::from(code)
}

async fn connect(cli: &Cli) -> anyhow::Result<Tristore> {
    let mut config = if cli.config.exists() {
        TristoreConfig::load(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "No config file, using defaults and environment");
        TristoreConfig::default()
    };
    config.apply_env();
    Tristore::connect(&config).await
}

fn exit_for(success: bool) -> u8 {
    if success {
        EXIT_OK
    } else {
        EXIT_RUN_FAILED
    }
}

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(headers.iter().map(|h| Cell::new(h).add_attribute(Attribute::Bold)));
    table
}

fn print_records(records: &[BackupRecord]) {
    if records.is_empty() {
        println!("No backups found.");
        return;
    }

    let mut table = new_table(&["ID", "Kind", "Status", "Started", "Duration", "Size", "Detail"]);
    for record in records {
        let duration = record
            .duration()
            .map(|d| format!("{}s", d.num_seconds()))
            .unwrap_or_else(|| "-".to_string());
        let size = record.size_bytes.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        let detail = record
            .storage_key
            .clone()
            .or_else(|| record.error_detail.clone())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(record.id),
            Cell::new(record.store_kind),
            Cell::new(record.status),
            Cell::new(record.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(duration),
            Cell::new(size),
            Cell::new(detail),
        ]);
    }
    println!("{table}");
}

fn print_backup_outcomes(outcomes: &[BackupOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(record) => println!(
                "{}: succeeded {} ({} bytes)",
                outcome.store_kind,
                record.id,
                record.size_bytes.unwrap_or(0)
            ),
            Err(e) => println!(
                "{}: failed at {} [{}] {}",
                outcome.store_kind,
                outcome.phase,
                e.category(),
                e
            ),
        }
    }
}

fn print_restore_outcomes(outcomes: &[RestoreOutcome]) {
    for outcome in outcomes {
        let record = outcome
            .record
            .as_ref()
            .map(|r| r.id.to_string())
            .unwrap_or_else(|| "-".to_string());
        match &outcome.result {
            Ok(()) => {
                let check = match &outcome.check {
                    Some(check) if check.matches => " fingerprint matches".to_string(),
                    Some(check) => format!(" fingerprint differs: expected {}, observed {}", check.expected, check.observed),
                    None => String::new(),
                };
                println!("{}: {} {}{}", outcome.store_kind, outcome.phase, record, check);
            }
            Err(e) => println!(
                "{}: failed at {} [{}] {}",
                outcome.store_kind,
                outcome.phase,
                e.category(),
                e
            ),
        }
    }
}

fn print_sweep(report: &SweepReport) {
    println!(
        "deleted {}, retained {}, kept below minimum {}, orphans removed {}",
        report.deleted.len(),
        report.retained.len(),
        report.skipped_below_minimum.len(),
        report.orphans_removed.len()
    );
    for id in &report.deleted {
        println!("  deleted {id}");
    }
    for key in &report.orphans_removed {
        println!("  orphan {key}");
    }
    for error in &report.errors {
        eprintln!("  error: {error}");
    }
}
