//! crmsync daemon entry point.
//!
//! `crmsync run` loads configuration, wires the connectors, engine and
//! poller, and keeps syncing until SIGINT/SIGTERM. The other subcommands run
//! a single cycle or inspect persisted state.

mod logging;
mod signals;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crmsync_core::batch::BatchJobRunner;
use crmsync_core::config::AppConfig;
use crmsync_core::connector::rest::RestConnector;
use crmsync_core::db::Database;
use crmsync_core::scheduler::Poller;
use crmsync_core::sync_engine::{EngineSettings, SyncEngine};
use crmsync_core::watermark::WatermarkStore;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Scheduled one-way CRM contact synchronization.
#[derive(Parser, Debug)]
#[command(
    name = "crmsync",
    version,
    about = "Poll a source CRM for changed contacts and upsert them into a target CRM"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// [default: <config dir>/crmsync/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the polling daemon until interrupted (default).
    Run,

    /// Run exactly one sync cycle and print its report.
    Sync,

    /// Show the stream watermark and recent sync runs.
    Status {
        /// Number of runs to show.
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Validate the configuration file.
    Validate,

    /// Write a starter configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./crmsync.toml")]
        output: PathBuf,
    },
}

/// How long shutdown waits for an in-flight cycle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let command = cli.command.unwrap_or(Commands::Run);

    if let Commands::Init { output } = &command {
        return cmd_init(output);
    }

    let config = AppConfig::load_and_resolve(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    if let Commands::Validate = command {
        println!("Configuration OK: {}", config_path.display());
        return Ok(());
    }

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = logging::init(&log_level, config.daemon.log_dir.as_deref())?;

    let db = Arc::new(open_database(&config)?);

    match command {
        Commands::Run => cmd_run(&config, &config_path, &log_level, db).await,
        Commands::Sync => cmd_sync(&config, db).await,
        Commands::Status { limit } => cmd_status(&config, db, limit),
        Commands::Audit { limit } => cmd_audit(&db, limit),
        Commands::Validate | Commands::Init { .. } => Ok(()),
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("crmsync").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("/etc/crmsync/config.toml"))
}

fn open_database(config: &AppConfig) -> Result<Database> {
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;
    let db_path = config.database_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());
    Ok(db)
}

fn watermark_store(config: &AppConfig, db: Arc<Database>) -> Result<Arc<WatermarkStore>> {
    let fallback = config
        .watermark_default()
        .context("invalid stream.default_watermark")?;
    Ok(Arc::new(WatermarkStore::new(db, fallback)))
}

fn build_engine(config: &AppConfig, db: Arc<Database>) -> Result<Arc<SyncEngine>> {
    let source = RestConnector::new(
        &config.source.base_url,
        &config.source.object,
        config.source.token.clone(),
    )
    .context("failed to create source connector")?;
    let target = RestConnector::new(
        &config.target.base_url,
        &config.target.object,
        config.target.token.clone(),
    )
    .context("failed to create target connector")?;

    let runner = Arc::new(BatchJobRunner::new(
        Arc::new(target),
        &config.stream.natural_key,
        config.batch.workers,
    ));
    let mapping = config.field_mapping().context("invalid field mapping")?;
    let watermarks = watermark_store(config, db.clone())?;

    Ok(Arc::new(SyncEngine::new(
        EngineSettings::from_config(config),
        Arc::new(source),
        mapping,
        runner,
        watermarks,
        db,
    )))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    config_path: &Path,
    log_level: &str,
    db: Arc<Database>,
) -> Result<()> {
    info!("========================================");
    info!("  crmsync v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", config_path.display());
    info!("Stream        : {}", config.stream.id);
    info!("Source        : {}/{}", config.source.base_url, config.source.object);
    info!("Target        : {}/{}", config.target.base_url, config.target.object);
    info!("Poll every    : {}ms (first after {}ms)", config.poll.frequency_ms, config.poll.start_delay_ms);
    info!("Job timeout   : {}ms", config.batch.job_timeout_ms);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    let engine = build_engine(config, db)?;
    let poller = Poller::new(engine);
    poller
        .start(
            Duration::from_millis(config.poll.frequency_ms),
            Duration::from_millis(config.poll.start_delay_ms),
        )
        .context("failed to start poller")?;

    let signal = signals::wait_for_shutdown().await;
    info!(?signal, "Shutdown signal received, stopping...");

    poller.stop().await;

    // Let an in-flight cycle finish so its outcome is recorded.
    if !poller.drain(SHUTDOWN_GRACE).await {
        warn!(
            "sync cycle still running after {}s, forcing shutdown",
            SHUTDOWN_GRACE.as_secs()
        );
    }

    let stats = poller.stats();
    info!(
        cycles = stats.total_cycles,
        skipped = stats.skipped_ticks,
        errors = stats.total_errors,
        "crmsync stopped"
    );
    Ok(())
}

async fn cmd_sync(config: &AppConfig, db: Arc<Database>) -> Result<()> {
    let engine = build_engine(config, db)?;
    let report = engine.run_sync_cycle().await.context("sync cycle failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_status(config: &AppConfig, db: Arc<Database>, limit: u32) -> Result<()> {
    let watermarks = watermark_store(config, db.clone())?;
    let stream = &config.stream.id;
    let watermark = watermarks.get(stream)?;
    let persisted = watermarks.is_persisted(stream)?;
    let runs = db.list_sync_runs(stream, limit)?;
    let errors = db.count_errors()?;

    let status = serde_json::json!({
        "stream": stream,
        "watermark": watermark.to_rfc3339(),
        "watermark_persisted": persisted,
        "failed_cycles": errors,
        "recent_runs": runs,
        "checked_at": chrono::Utc::now().to_rfc3339(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn cmd_audit(db: &Database, limit: u32) -> Result<()> {
    let entries = db.list_audit_log(limit)?;
    if entries.is_empty() {
        println!("No audit log entries.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{} [{}] {} {}: {}",
            entry.created_at,
            if entry.success { "ok" } else { "FAIL" },
            entry.action,
            entry.stream.as_deref().unwrap_or("-"),
            entry.details.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# crmsync configuration

[daemon]
log_level = "info"
data_dir = "/var/lib/crmsync"
# log_dir = "/var/log/crmsync"

[poll]
frequency_ms = 30000
start_delay_ms = 8000

[batch]
page_size = 100
workers = 4
job_timeout_ms = 300000
await_poll_interval_ms = 500

[stream]
id = "contacts"
default_watermark = "now-100s"
natural_key = "lastname"
required_target_fields = ["lastname"]

[source]
base_url = "https://source-crm.example.com/api"
object = "contacts"
token_env = "CRMSYNC_SOURCE_TOKEN"

[target]
base_url = "https://target-crm.example.com/api"
object = "contacts"
token_env = "CRMSYNC_TARGET_TOKEN"

# Omit [[mapping]] entirely to use the built-in contact mapping.
[[mapping]]
source = "LastName"
target = "lastname"
required = true

[[mapping]]
source = "Email"
target = "emailaddress1"

[[mapping]]
source = "Description"
target = "description"

[[mapping]]
source = "Fax"
target = "fax"

[[mapping]]
source = "Phone"
target = "telephone1"
"#;

    if output.exists() {
        anyhow::bail!("{} already exists; refusing to overwrite", output.display());
    }
    std::fs::write(output, default_config)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["crmsync", "--config", "/tmp/c.toml", "status", "-l", "3"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Some(Commands::Status { limit: 3 })));

        let cli = Cli::try_parse_from(["crmsync"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_init_writes_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crmsync.toml");
        cmd_init(&path).unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mapping.len(), 5);
        assert!(cmd_init(&path).is_err());
    }
}
