//! iofs - mount a directory through an instrumented passthrough filesystem.
//!
//! Usage: iofs [OPTIONS] <MOUNTPOINT> <SOURCE>
//!
//! Per-operation metrics are served in Prometheus text format on
//! `http://<metrics-bind>:<metrics-port>/metrics` while the mount is live.

use anyhow::{Context, Result};
use clap::Parser;
use iofs_fuse::{mount, MountConfig, SinkConfig};
use iofs_metrics::ExporterConfig;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "iofs")]
#[command(about = "Mount a directory through a passthrough filesystem that records I/O metrics")]
#[command(version)]
struct Cli {
    /// Where the mirrored tree appears
    mountpoint: PathBuf,

    /// Directory to mirror
    source: PathBuf,

    /// Allow other users to access the mount
    #[arg(short, long)]
    allow_other: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Write logs to this file instead of stderr
    #[arg(short, long)]
    logfile: Option<PathBuf>,

    /// Sink output file
    #[arg(short = 'O', long, default_value = iofs_fuse::config::DEFAULT_OUTFILE)]
    outfile: String,

    /// Port for the metrics endpoint
    #[arg(short = 'p', long, default_value_t = iofs_metrics::exporter::DEFAULT_PORT)]
    metrics_port: u16,

    /// Address for the metrics endpoint
    #[arg(long, default_value = "0.0.0.0")]
    metrics_bind: IpAddr,

    /// Do not start the metrics endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Route reads and writes through the buffer-vector path
    #[arg(long)]
    zero_copy: bool,

    /// Sink verbosity
    #[arg(short, long, default_value_t = 10)]
    verbosity: u32,

    /// Sink push interval in seconds
    #[arg(short, long, default_value_t = 1)]
    interval: u64,

    /// Elasticsearch server
    #[arg(long)]
    es_server: Option<String>,

    /// Elasticsearch port
    #[arg(long)]
    es_port: Option<u16>,

    /// Elasticsearch URI
    #[arg(long)]
    es_uri: Option<String>,

    /// InfluxDB server
    #[arg(long)]
    in_server: Option<String>,

    /// InfluxDB database
    #[arg(long)]
    in_db: Option<String>,

    /// InfluxDB tag (repeatable)
    #[arg(short = 't', long)]
    in_tags: Vec<String>,

    /// InfluxDB user name
    #[arg(long)]
    in_username: Option<String>,

    /// InfluxDB password
    #[arg(long)]
    in_password: Option<String>,

    /// CSV file for read/write records
    #[arg(long)]
    csv_rw_path: Option<String>,
}

impl Cli {
    fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            outfile: self.outfile.clone(),
            verbosity: self.verbosity,
            interval: self.interval,
            es_server: self.es_server.clone(),
            es_port: self.es_port,
            es_uri: self.es_uri.clone(),
            in_server: self.in_server.clone(),
            in_db: self.in_db.clone(),
            in_tags: self.in_tags.clone(),
            in_username: self.in_username.clone(),
            in_password: self.in_password.clone(),
            csv_rw_path: self.csv_rw_path.clone(),
        }
    }

    fn mount_config(&self) -> MountConfig {
        let metrics = (!self.no_metrics).then(|| {
            ExporterConfig::with_port(self.metrics_port).bind_address(self.metrics_bind)
        });
        MountConfig::default()
            .zero_copy(self.zero_copy)
            .allow_other(self.allow_other)
            .metrics(metrics)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    if !cli.mountpoint.is_dir() {
        anyhow::bail!("Mountpoint is not a directory: {}", cli.mountpoint.display());
    }

    let sinks = cli.sink_config();
    debug!(
        outfile = %sinks.outfile,
        verbosity = sinks.verbosity,
        interval = sinks.interval,
        "sink settings"
    );
    for sink in sinks.requested_sinks() {
        warn!(sink, "metric sink options given but not wired; ignoring");
    }

    // Created files and directories get exactly the mode the caller asked for.
    unsafe {
        libc::umask(0);
    }

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    let handle = mount(&cli.source, &cli.mountpoint, cli.mount_config())
        .with_context(|| format!("Failed to mount {}", cli.source.display()))?;

    match handle.metrics_addr() {
        Some(addr) => info!("Metrics available at http://{addr}/metrics"),
        None => info!("Metrics endpoint disabled"),
    }
    info!(
        "Mounted {} at {} (press Ctrl+C to unmount)",
        cli.source.display(),
        cli.mountpoint.display()
    );

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    drop(handle);
    info!("Filesystem unmounted");
    Ok(())
}

/// Installs the global subscriber. The returned guard flushes the log file
/// on drop and must live until exit.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(logfile) = &cli.logfile else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    };

    let file_name = logfile
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", logfile.display()))?;
    let dir = logfile
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();
    Ok(Some(guard))
}
