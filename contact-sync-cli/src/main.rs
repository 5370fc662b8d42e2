use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use contact_sync::snapshot::last_sync_time;
use contact_sync::{
    FsSnapshotStore, MergeStrategy, ProgressChannel, SnapshotStore, SyncEngine, SyncEvent,
    SyncOutcome, SyncReport,
};

mod config;
mod telemetry;

use config::{default_config_path, CliConfig};

#[derive(Parser)]
#[command(name = "contact-sync")]
#[command(about = "Reconcile contacts between two folder-backed address books")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize two configured sources
    Sync {
        /// Local source name
        #[arg(short, long)]
        local: String,
        /// Remote source name
        #[arg(short, long)]
        remote: String,
        /// Merge strategy override (prefer_remote, prefer_local, prefer_newer, union_fields)
        #[arg(long)]
        strategy: Option<MergeStrategy>,
        /// Reconcile without writing snapshots or touching the folders
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-read a single source and list its contacts
    Refresh {
        #[arg(short, long)]
        source: String,
    },
    /// List the snapshots kept for a source
    Snapshots {
        #[arg(short, long)]
        source: String,
    },
    /// Write a default configuration file
    InitConfig {
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path, force } = &cli.command {
        return init_config(path, *force).await;
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = CliConfig::load(&config_path).await?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.logging.json |= cli.json_logs;
    config.validate()?;

    let _log_guard = telemetry::initialize_logging(&config.logging)?;
    info!(config = %config_path.display(), "Loaded configuration");

    match cli.command {
        Commands::Sync {
            local,
            remote,
            strategy,
            dry_run,
        } => run_sync(&config, &local, &remote, strategy, dry_run).await,
        Commands::Refresh { source } => run_refresh(&config, &source).await,
        Commands::Snapshots { source } => list_snapshots(&config, &source).await,
        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }

    CliConfig::default().save(path).await?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn run_sync(
    config: &CliConfig,
    local: &str,
    remote: &str,
    strategy: Option<MergeStrategy>,
    dry_run: bool,
) -> Result<()> {
    let local = config.source(local)?.open();
    let remote = config.source(remote)?.open();

    let mut options = config.sync_options();
    if let Some(strategy) = strategy {
        options.merge_strategy = strategy;
    }
    if dry_run {
        options.persist_snapshots = false;
        options.run_update_phase = false;
    }

    let (reporter, channel) = ProgressChannel::new();
    let printer = tokio::spawn(print_events(channel));

    let store = Arc::new(FsSnapshotStore::new(&config.snapshot_dir));
    let engine = SyncEngine::new(options, store).with_progress(reporter);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, canceling sync");
            interrupt.cancel();
        }
    });

    let report = engine
        .sync_with_cancel(&local, &remote, cancel)
        .await
        .with_context(|| format!("Sync between '{}' and '{}' failed", local.name(), remote.name()))?;

    drop(engine);
    if let Err(e) = printer.await {
        warn!(error = %e, "Progress printer stopped unexpectedly");
    }
    print_report(&report, dry_run);
    Ok(())
}

async fn run_refresh(config: &CliConfig, source: &str) -> Result<()> {
    let source = config.source(source)?.open();
    let store = Arc::new(FsSnapshotStore::new(&config.snapshot_dir));
    let engine = SyncEngine::new(config.sync_options(), store);

    let report = engine.sync(&source, &source).await?;
    println!("{} ({} contacts)", source.display_name(), report.contacts.len());
    for contact in &report.contacts {
        let detail = contact
            .email
            .as_deref()
            .or(contact.phone.as_deref())
            .unwrap_or("");
        println!("  {:<40} {}", contact.full_name, detail);
    }
    Ok(())
}

async fn list_snapshots(config: &CliConfig, source: &str) -> Result<()> {
    let source = config.source(source)?;
    let store = FsSnapshotStore::new(&config.snapshot_dir);

    let keys = store.keys(&source.name).await?;
    println!("{} snapshots for '{}'", keys.len(), source.name);
    for key in keys {
        let last_sync = last_sync_time(&store, &source.name, &key)
            .await?
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!("  {:<40} {}", key, last_sync);
    }
    Ok(())
}

async fn print_events(mut channel: ProgressChannel) {
    while let Some(event) = channel.recv().await {
        match event {
            SyncEvent::Progress { source, message, .. } => debug!(source, "{}", message),
            SyncEvent::Warning { message } => eprintln!("warning: {}", message),
            SyncEvent::CancelSync { source, message, .. } => {
                eprintln!("{}: {}", source, message)
            }
            SyncEvent::EndSync { source, destination } => {
                info!(source, destination, "Sync finished")
            }
            _ => {}
        }
    }
}

fn print_report(report: &SyncReport, dry_run: bool) {
    match report.outcome {
        SyncOutcome::Canceled => {
            println!("Sync canceled");
            return;
        }
        SyncOutcome::Refreshed | SyncOutcome::Completed => {}
    }

    let summary = report.summary();
    if dry_run {
        println!("Dry run, nothing was written");
    }
    println!(
        "Added {} to local, {} to remote; updated {} local, {} remote; merged {}; unchanged {}",
        summary.adds_to_local,
        summary.adds_to_remote,
        summary.updates_to_local,
        summary.updates_to_remote,
        summary.merges,
        summary.unchanged,
    );
    println!("{}", report.metrics.summary());
}
