//! vetsync CLI
//!
//! Thin wrapper over vetsync-core: run the mutation server, inspect and
//! manage the device queue, and trigger a drain.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use tracing::info;

use vetsync_core::backing_store::BackingStore;
use vetsync_core::config::Config;
use vetsync_core::connectivity::ConnectivityMonitor;
use vetsync_core::error::format_error_with_remediation;
use vetsync_core::kv_store::{KvStore, SqliteKv};
use vetsync_core::logging::init_logging;
use vetsync_core::mutation::{MutationKind, QueueItemView};
use vetsync_core::mutation_queue::MutationQueueStore;
use vetsync_core::service::MutationService;
use vetsync_core::sync_engine::{SyncEngine, SyncSettings};
use vetsync_core::transport::HttpTransport;
use vetsync_core::web::{WebServerConfig, run_web_server};

/// Exit code when a drain stopped because the server was unreachable.
const EXIT_OFFLINE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "vetsync", version, about = "Offline-first medication administration sync")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "VETSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the client data directory
    #[arg(long, global = true, env = "VETSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    /// Verbose logging (repeat for debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the mutation server
    Serve {
        /// Listen address (overrides server.listen)
        #[arg(long)]
        listen: Option<String>,
        /// Backing store database (overrides server.db_path)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Allow binding on a non-localhost address
        #[arg(long)]
        dangerous_bind_any: bool,
    },

    /// Inspect and manage the device queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Drain the queue against the server once
    Sync {
        /// Server base URL (overrides client.server_url)
        #[arg(long)]
        server: Option<String>,
        /// Ignore backoff deadlines
        #[arg(long)]
        force: bool,
    },

    /// Query server health
    Health {
        #[arg(long)]
        server: Option<String>,
        /// Include circuit, admission and rate-limit state
        #[arg(long)]
        detailed: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Backing store maintenance
    Store {
        /// Backing store database (overrides server.db_path)
        #[arg(long, global = true)]
        db: Option<PathBuf>,
        #[command(subcommand)]
        command: StoreCommands,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Validate and queue a mutation
    Enqueue {
        /// record-administration | adjust-inventory-quantity | mark-inventory-in-use
        kind: String,
        /// JSON payload
        payload: String,
        /// Use a specific mutation id instead of generating one
        #[arg(long)]
        id: Option<String>,
    },
    /// List queued mutations in delivery order
    List,
    /// Return a failed mutation to pending
    Retry { id: String },
    /// Drop a failed mutation
    Discard { id: String },
    /// Remove every queued mutation
    Clear {
        /// Confirm removal
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

#[derive(Subcommand, Debug)]
enum StoreCommands {
    /// Register an inventory lot
    AddLot {
        lot_id: String,
        medication_id: String,
        quantity: f64,
        unit: String,
    },
    /// Purge idempotency records older than the retention window
    PurgeLedger {
        /// Override server.ledger_retention_days
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<vetsync_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).map_err(vetsync_core::Error::from)?;
    if let Some(dir) = &cli.data_dir {
        config.client.data_dir.clone_from(dir);
    }
    Ok(config)
}

fn init_cli_logging(cli: &Cli, config: &Config) {
    let serving = matches!(cli.command, Commands::Serve { .. });
    let log = config.logging.clone().with_verbosity(cli.verbose, serving);
    if let Err(err) = init_logging(&log) {
        eprintln!("warning: logging disabled: {err}");
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli)?;
    init_cli_logging(&cli, &config);

    match &cli.command {
        Commands::Serve {
            listen,
            db,
            dangerous_bind_any,
        } => serve(config, listen.clone(), db.clone(), *dangerous_bind_any),
        Commands::Queue { command } => queue_command(&config, command, cli.format),
        Commands::Sync { server, force } => sync(&config, server.clone(), *force, cli.format),
        Commands::Health { server, detailed } => {
            health(&config, server.clone(), *detailed, cli.format)
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                print!("{}", config.to_toml().map_err(vetsync_core::Error::from)?);
                Ok(ExitCode::SUCCESS)
            }
        },
        Commands::Store { db, command } => {
            store_command(&config, db.as_deref(), command, cli.format)
        }
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn serve(
    mut config: Config,
    listen: Option<String>,
    db: Option<PathBuf>,
    dangerous_bind_any: bool,
) -> anyhow::Result<ExitCode> {
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    if let Some(db) = db {
        config.server.db_path = db;
    }
    info!(
        listen = %config.server.listen,
        db = %config.server.db_path.display(),
        "Opening backing store"
    );
    let service = MutationService::from_config(&config)
        .with_context(|| format!("failed to open store at {}", config.server.db_path.display()))?;
    let mut web = WebServerConfig::new(config.server.listen.clone());
    if dangerous_bind_any {
        web = web.with_dangerous_public_bind();
    }
    runtime()?.block_on(run_web_server(web, Arc::new(service)))?;
    Ok(ExitCode::SUCCESS)
}

fn open_queue(config: &Config) -> anyhow::Result<Arc<MutationQueueStore>> {
    let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&config.queue_db_path())?);
    Ok(Arc::new(MutationQueueStore::open(kv, config.queue.clone())?))
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(|| ms.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn print_views(views: &[QueueItemView]) {
    if views.is_empty() {
        println!("Queue is empty");
        return;
    }
    for view in views {
        let mut line = format!(
            "{}  {:<26} {:<8} age={}s attempts={}/{}",
            view.id,
            view.kind,
            view.state,
            view.age_ms / 1_000,
            view.attempts,
            view.max_attempts
        );
        if let Some(wait) = view.next_attempt_in_ms {
            line.push_str(&format!(" retry_in={}s", wait.div_ceil(1_000)));
        }
        if let Some(err) = &view.last_error {
            line.push_str(&format!(" last_error=\"{err}\""));
        }
        println!("{line}");
    }
}

fn emit(format: OutputFormat, value: &Value, plain: impl FnOnce()) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Plain => plain(),
    }
    Ok(())
}

fn queue_command(
    config: &Config,
    command: &QueueCommands,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let queue = open_queue(config)?;
    match command {
        QueueCommands::Enqueue { kind, payload, id } => {
            let kind: MutationKind = kind.parse().map_err(vetsync_core::Error::from)?;
            let payload: Value = serde_json::from_str(payload)
                .map_err(vetsync_core::Error::from)
                .context("payload is not valid JSON")?;
            let record = match id {
                Some(id) => queue.enqueue_with_id(id, kind, payload)?,
                None => queue.enqueue(kind, payload)?,
            };
            emit(format, &serde_json::to_value(&record)?, || {
                println!("Queued {} ({})", record.id, record.kind);
                println!("Created at {}", format_ms(record.created_at));
            })?;
        }
        QueueCommands::List => {
            let views = queue.views();
            let status = queue.status();
            emit(
                format,
                &json!({
                    "pending": status.pending,
                    "failed": status.failed,
                    "items": views,
                }),
                || {
                    println!("pending={} failed={}", status.pending, status.failed);
                    print_views(&views);
                },
            )?;
        }
        QueueCommands::Retry { id } => {
            let record = queue.retry(id)?;
            emit(format, &serde_json::to_value(&record)?, || {
                println!("{} returned to pending", record.id);
            })?;
        }
        QueueCommands::Discard { id } => {
            let record = queue.discard(id)?;
            emit(format, &serde_json::to_value(&record)?, || {
                println!("{} discarded", record.id);
            })?;
        }
        QueueCommands::Clear { yes } => {
            let removed = queue.clear(*yes)?;
            emit(format, &json!({ "removed": removed }), || {
                println!("Removed {removed} mutation(s)");
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn sync(
    config: &Config,
    server: Option<String>,
    force: bool,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let queue = open_queue(config)?;
    let server_url = server.unwrap_or_else(|| config.client.server_url.clone());
    let transport = Arc::new(HttpTransport::new(
        server_url.clone(),
        config.client.request_timeout(),
    ));
    let engine = SyncEngine::new(
        queue,
        transport,
        ConnectivityMonitor::new(true),
        SyncSettings::from_config(config),
    );
    info!(server = %server_url, force, pending = engine.status().pending, "Starting drain");
    let report = runtime()?.block_on(engine.drain_once(force))?;
    let status = engine.status();
    emit(
        format,
        &json!({ "report": report, "status": status }),
        || {
            println!(
                "delivered={} retried={} failed={} skipped={}",
                report.delivered, report.retried, report.failed, report.skipped
            );
            println!("pending={} failed={}", status.pending, status.failed);
            if report.interrupted {
                println!("Server unreachable; remaining items stay queued");
            }
        },
    )?;
    Ok(if report.interrupted {
        ExitCode::from(EXIT_OFFLINE)
    } else {
        ExitCode::SUCCESS
    })
}

fn health(
    config: &Config,
    server: Option<String>,
    detailed: bool,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let server_url = server.unwrap_or_else(|| config.client.server_url.clone());
    let transport = HttpTransport::new(server_url.clone(), config.client.request_timeout());
    let body = runtime()?
        .block_on(transport.health(detailed))
        .with_context(|| format!("health check against {server_url} failed"))?;
    emit(format, &body, || print_health(&body))?;
    Ok(ExitCode::SUCCESS)
}

fn print_health(body: &Value) {
    let text = |value: &Value| value.as_str().unwrap_or("?").to_string();
    println!("status   {}", text(&body["status"]));
    println!("version  {}", text(&body["version"]));
    if let Some(records) = body["ledger_records"].as_u64() {
        println!("ledger   {records} records");
    }
    let resilience = &body["resilience"];
    if resilience.is_null() {
        return;
    }
    let admission = &resilience["admission"];
    println!(
        "admit    {}/{} active, {}/{} queued, {} rejected",
        admission["active"],
        admission["max_concurrent"],
        admission["queue_depth"],
        admission["queue_capacity"],
        admission["rejected_total"],
    );
    if let Some(circuits) = resilience["circuits"].as_array() {
        for circuit in circuits {
            println!(
                "circuit  {:<22} {}",
                text(&circuit["class"]),
                text(&circuit["status"]["state"]),
            );
        }
    }
}

fn store_command(
    config: &Config,
    db: Option<&Path>,
    command: &StoreCommands,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let db_path = db.unwrap_or(&config.server.db_path);
    let store = BackingStore::open(db_path)
        .with_context(|| format!("failed to open store at {}", db_path.display()))?;
    match command {
        StoreCommands::AddLot {
            lot_id,
            medication_id,
            quantity,
            unit,
        } => {
            if !quantity.is_finite() || *quantity < 0.0 {
                bail!("quantity must be a non-negative number");
            }
            let lot = store.create_lot(lot_id, medication_id, *quantity, unit)?;
            emit(format, &serde_json::to_value(&lot)?, || {
                println!("Added lot {} ({} {})", lot.lot_id, lot.quantity_remaining, lot.unit);
            })?;
        }
        StoreCommands::PurgeLedger { older_than_days } => {
            let retention = older_than_days.map_or_else(
                || config.server.ledger_retention(),
                |days| std::time::Duration::from_secs(u64::from(days) * 86_400),
            );
            let purged = store.purge_ledger(retention)?;
            emit(format, &json!({ "purged": purged }), || {
                println!("Purged {purged} ledger record(s)");
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
