//! Stowage WAL control - operator tool
//!
//! Opens a WAL directory (running normal recovery) and inspects or
//! maintains it: list operations, show statistics, seal, compact and
//! garbage-collect partitions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use stowage_common::config::LoggingConfig;
use stowage_common::{BackendId, Config, OperationId, OperationStatus, SystemClock};
use stowage_wal::{ListFilter, PartitionId, PartitionState, WalStore};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "stowage-walctl")]
#[command(about = "Inspect and maintain a Stowage write-ahead log")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WAL directory (overrides wal.dir from the config file)
    #[arg(long)]
    wal_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List operations, oldest first
    List {
        /// Only operations for this backend
        #[arg(long)]
        backend: Option<BackendId>,
        /// Only operations in this status
        #[arg(long)]
        status: Option<OperationStatus>,
        /// Maximum number of operations to print
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Show one operation with its error history
    Show { id: OperationId },
    /// WAL-wide and per-backend statistics
    Stats,
    /// List partitions
    Partitions {
        #[arg(long)]
        backend: Option<BackendId>,
    },
    /// Seal the active partition of a backend
    Seal { backend: BackendId },
    /// Compact one sealed partition
    Compact { backend: BackendId, seq: u64 },
    /// Compact and delete sealed partitions older than the cutoff
    Gc {
        #[arg(long)]
        older_than_secs: u64,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) if path.exists() => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        Some(path) => {
            eprintln!("Config file {} not found, using defaults", path.display());
            Config::default()
        }
        None => Config::default(),
    };

    if let Some(dir) = &args.wal_dir {
        config.wal.dir.clone_from(dir);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.json_logs {
        config.logging.json = true;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging);

    let wal = open_wal(&config.wal.dir, &config)?;
    let mut out = std::io::stdout().lock();
    let result = run(&args.command, &wal, args.json, &mut out);
    wal.shutdown().context("closing WAL")?;
    result
}

fn open_wal(dir: &Path, config: &Config) -> Result<stowage_wal::WalHandle> {
    let wal = stowage_wal::init(dir, config.wal.clone(), SystemClock::shared())
        .with_context(|| format!("opening WAL at {}", dir.display()))?;
    info!(dir = %dir.display(), operations = wal.len(), "Opened WAL");
    Ok(wal)
}

fn print_json(out: &mut impl Write, value: &impl serde::Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn run(command: &Commands, wal: &WalStore, json: bool, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::List {
            backend,
            status,
            limit,
        } => {
            let mut filter = ListFilter::all();
            if let Some(backend) = backend {
                filter = filter.with_backend(backend.clone());
            }
            if let Some(status) = status {
                filter = filter.with_status(*status);
            }
            let ops: Vec<_> = wal.list(filter).take(*limit).collect();

            if json {
                return print_json(out, &ops);
            }
            writeln!(
                out,
                "{:<36}  {:<10}  {:<10}  {:<10}  {:>8}  CREATED",
                "ID", "BACKEND", "KIND", "STATUS", "ATTEMPTS"
            )?;
            for op in &ops {
                writeln!(
                    out,
                    "{:<36}  {:<10}  {:<10}  {:<10}  {:>4}/{:<3}  {}",
                    op.id.to_string(),
                    op.backend_id.as_str(),
                    op.kind.name(),
                    op.status.as_str(),
                    op.attempt_count,
                    op.max_attempts,
                    op.created_at.to_rfc3339()
                )?;
            }
            writeln!(out, "{} operation(s)", ops.len())?;
        }
        Commands::Show { id } => {
            let op = wal.get(*id)?;
            if json {
                return print_json(out, &op);
            }
            writeln!(out, "Operation {}", op.id)?;
            writeln!(out, "  backend:     {}", op.backend_id)?;
            writeln!(out, "  kind:        {} ({})", op.kind.name(), op.kind.content())?;
            writeln!(out, "  payload:     {}", op.payload_ref)?;
            writeln!(out, "  status:      {}", op.status)?;
            writeln!(out, "  attempts:    {}/{}", op.attempt_count, op.max_attempts)?;
            writeln!(out, "  created:     {}", op.created_at.to_rfc3339())?;
            writeln!(out, "  updated:     {}", op.updated_at.to_rfc3339())?;
            if let Some(at) = op.next_retry_at {
                writeln!(out, "  next retry:  {}", at.to_rfc3339())?;
            }
            if let Some(lease) = op.lease {
                writeln!(out, "  lease:       {} until {}", lease.worker, lease.expires_at.to_rfc3339())?;
            }
            for error in &op.error_history {
                writeln!(
                    out,
                    "  error #{}:    [{}] {} at {}",
                    error.attempt,
                    error.class,
                    error.message,
                    error.at.to_rfc3339()
                )?;
            }
        }
        Commands::Stats => {
            let stats = wal.stats();
            if json {
                return print_json(out, &stats);
            }
            writeln!(out, "Operations: {}", stats.operations)?;
            for (status, count) in &stats.status_counts {
                writeln!(out, "  {status:<10} {count}")?;
            }
            writeln!(out, "Bytes:      {} / {}", stats.total_bytes, stats.max_total_bytes)?;
            writeln!(out, "Next LSN:   {}", stats.next_lsn)?;
            for backend in &stats.backends {
                let active = backend
                    .active
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |info| info.id.to_string());
                writeln!(
                    out,
                    "Backend {}: {} operation(s), {} record(s), {} bytes, {} sealed, active {}",
                    backend.backend,
                    backend.operations,
                    backend.records,
                    backend.bytes,
                    backend.sealed_partitions,
                    active
                )?;
            }
        }
        Commands::Partitions { backend } => {
            let partitions = wal.partitions(backend.as_ref());
            if json {
                return print_json(out, &partitions);
            }
            for info in &partitions {
                let state = match info.state {
                    PartitionState::Active => "active",
                    PartitionState::Sealed => "sealed",
                };
                let newest = info
                    .newest_record_at
                    .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
                writeln!(
                    out,
                    "{}  {:<6}  {:>6} record(s)  {:>10} bytes  newest {}",
                    info.id, state, info.records, info.bytes, newest
                )?;
            }
        }
        Commands::Seal { backend } => match wal.seal_partition(backend)? {
            Some(id) => {
                info!(partition = %id, "Sealed partition");
                writeln!(out, "Sealed {id}")?;
            }
            None => {
                warn!(backend = %backend, "Nothing to seal");
                writeln!(out, "No active partition for {backend}")?;
            }
        },
        Commands::Compact { backend, seq } => {
            let report = wal.compact(&PartitionId::new(backend.clone(), *seq))?;
            if json {
                return print_json(out, &report);
            }
            writeln!(
                out,
                "Compacted {}/{:010}: {} -> {} record(s), {} operation(s) removed, {} bytes reclaimed",
                backend,
                seq,
                report.records_before,
                report.records_after,
                report.operations_removed,
                report.bytes_reclaimed
            )?;
        }
        Commands::Gc { older_than_secs } => {
            let before = i64::try_from(*older_than_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
                .context("--older-than-secs out of range")?;
            let report = wal.gc(before)?;
            if json {
                return print_json(out, &report);
            }
            writeln!(
                out,
                "GC: {} partition(s) compacted, {} deleted, {} record(s) dropped, {} operation(s) removed, {} bytes reclaimed",
                report.partitions_compacted,
                report.partitions_deleted.len(),
                report.records_dropped,
                report.operations_removed,
                report.bytes_reclaimed
            )?;
            for id in &report.partitions_deleted {
                writeln!(out, "  deleted {id}")?;
            }
        }
    }
    Ok(())
}
