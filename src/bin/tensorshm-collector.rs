//! tensorshm collector sidecar
//!
//! Runs next to the serving containers of one host, periodically reporting
//! the resident shared segments and reconciling references left behind by
//! crashed processes.
//!
//! Reports go to a JSON file (`--output`), a Unix socket (`--socket`) or,
//! by default, stdout as one JSON document per line.

use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tensorshm::collector::{Collector, InventoryReport, InventorySink, JsonFileSink, SocketSink};
use tensorshm::config::{CollectorConfig, ReclaimPolicy, StoreConfig};
use tensorshm::store::StoreHandle;
use tracing_subscriber::{EnvFilter, fmt};

/// Report resident shared tensor segments to the scheduler
#[derive(Parser, Debug)]
#[command(name = "tensorshm-collector")]
#[command(version)]
#[command(about = "Report resident shared tensor segments to the scheduler")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Segment directory (default: TENSORSHM_SHM_DIR or /dev/shm/tensorshm)
    #[arg(long)]
    shm_dir: Option<PathBuf>,

    /// Lock directory (default: TENSORSHM_LOCK_DIR or /dev/shm/tensorshm-locks)
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Node identifier (default: TENSORSHM_NODE_ID or the host name)
    #[arg(long)]
    node_id: Option<String>,

    /// Milliseconds between scans (default: TENSORSHM_COLLECT_INTERVAL_MS or 5000)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Write each report to this JSON file, replacing it atomically
    #[arg(long, conflicts_with = "socket")]
    output: Option<PathBuf>,

    /// Stream framed reports to this Unix socket
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Do not reconcile dead holders or reclaim idle segments
    #[arg(long)]
    no_reconcile: bool,

    /// Keep zero-count segments without an agent keep-warm deadline for this
    /// many seconds before reclaiming
    #[arg(long)]
    keep_warm_secs: Option<u64>,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

/// Writes reports to stdout as JSON lines.
struct StdoutSink;

impl InventorySink for StdoutSink {
    fn publish(&mut self, report: &InventoryReport) -> tensorshm::Result<()> {
        let mut out = std::io::stdout().lock();
        serde_json::to_writer(&mut out, report)
            .map_err(|e| tensorshm::Error::Publish(e.to_string()))?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        tracing::error!("collector failed: {e}");
        eprintln!("tensorshm-collector: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> tensorshm::Result<()> {
    let mut store_config = StoreConfig::from_env();
    if let Some(dir) = cli.shm_dir {
        store_config.shm_dir = dir;
    }
    if let Some(dir) = cli.lock_dir {
        store_config.lock_dir = dir;
    }

    let mut config = CollectorConfig::from_env()?.with_reconcile(!cli.no_reconcile);
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(ms) = cli.interval_ms {
        if ms == 0 {
            return Err(tensorshm::Error::Config("--interval-ms must be > 0".into()));
        }
        config = config.with_interval(Duration::from_millis(ms));
    }
    if let Some(secs) = cli.keep_warm_secs {
        config = config.with_reclaim(ReclaimPolicy::KeepWarm(Duration::from_secs(secs)));
    }

    let store = StoreHandle::open(store_config)?;
    tracing::info!(
        node = %config.node_id,
        shm_dir = %store.config().shm_dir.display(),
        interval = ?config.interval,
        reconcile = config.reconcile,
        "starting collector"
    );

    let mut sink: Box<dyn InventorySink> = match (cli.output, cli.socket) {
        (Some(path), _) => Box::new(JsonFileSink::new(path)),
        (None, Some(path)) => Box::new(SocketSink::new(path)),
        (None, None) => Box::new(StdoutSink),
    };

    let collector = Collector::new(store, config);
    if cli.once {
        collector.tick(sink.as_mut())?;
        return Ok(());
    }

    collector.spawn(sink)?.wait();
    Ok(())
}
