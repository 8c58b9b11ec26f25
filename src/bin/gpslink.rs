//! gpslink - Bluetooth GPS telemetry link
//!
//! Connects to a GPS device over RFCOMM, prints one JSON line per
//! telemetry record on stdout and one `EVENT_NAME:details` diagnostic
//! line per link event on stderr. Reconnects on stalls and drops.
//!
//! # Usage
//!
//! ```bash
//! # Discover the channel and stream
//! gpslink 64:9D:38:3E:1E:D1
//!
//! # Force a channel, stream through /dev/rfcommN instead of a socket
//! gpslink 64:9D:38:3E:1E:D1 --channel 12 --transport device
//!
//! # Debug logging (written to the log file, never to stdout)
//! RUST_LOG=gpslink=debug gpslink 64:9D:38:3E:1E:D1
//! ```
//!
//! # Exit Status
//!
//! - 0: stopped by a signal or the consumer after streaming
//! - 1: no connection could be established, or a fatal link error
//! - 2: invalid address, arguments or configuration
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: close the link, release any bound device, exit

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use gpslink_core::{BtAddress, Channel};
use gpslink_supervisor::{Capabilities, DiagnosticSink, LinkConfig, LinkSupervisor, TransportKind};

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;

/// Resilient Bluetooth RFCOMM link for NDJSON GPS telemetry
#[derive(Parser, Debug)]
#[command(name = "gpslink", version, about)]
struct Args {
    /// Bluetooth address of the device (e.g. 64:9D:38:3E:1E:D1)
    address: String,

    /// RFCOMM channel to try first; skips service discovery
    #[arg(long, short = 'c')]
    channel: Option<u16>,

    /// Transport: `socket` (RFCOMM socket) or `device` (bound /dev/rfcommN)
    #[arg(long, short = 't')]
    transport: Option<TransportKind>,

    /// Configuration file (default: $XDG_CONFIG_HOME/gpslink/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log file (default: $XDG_STATE_HOME/gpslink/gpslink.log)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Do not send the client hello after connecting
    #[arg(long)]
    no_handshake: bool,

    /// Run rfcomm/bluetoothctl without sudo
    #[arg(long)]
    no_sudo: bool,
}

/// Validated inputs for one run.
#[derive(Debug)]
struct Settings {
    address: BtAddress,
    config: LinkConfig,
}

// ============================================================================
// Settings
// ============================================================================

/// Layers defaults, config file, environment and flags, in that order.
///
/// The address is checked first so a bad one never touches the config
/// file or the Bluetooth stack.
fn resolve_settings<F>(args: &Args, env: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let address = BtAddress::parse(&args.address)
        .with_context(|| format!("Invalid address {:?}", args.address))?;

    let mut config =
        LinkConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    config
        .apply_env_with(env)
        .context("Invalid environment override")?;

    if let Some(number) = args.channel {
        config.channel = Some(Channel::new(number).context("Invalid --channel")?);
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if args.no_handshake {
        config.handshake.enabled = false;
    }
    if args.no_sudo {
        config.use_sudo = false;
    }
    config.validate().context("Invalid configuration")?;

    Ok(Settings { address, config })
}

// ============================================================================
// Logging
// ============================================================================

/// `$XDG_STATE_HOME/gpslink/gpslink.log` or the platform equivalent.
fn default_log_path() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::cache_dir)
        .map(|dir| dir.join("gpslink").join("gpslink.log"))
}

/// Opens the log file in append mode, creating its directory.
///
/// Warns on stderr and returns `None` if that fails.
fn create_log_file(path: &Path) -> Option<fs::File> {
    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir) {
            eprintln!("Warning: Failed to create log directory {dir:?}: {e}");
            return None;
        }
    }

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Warning: Failed to open log file {path:?}: {e}");
            None
        }
    }
}

fn directive(text: &str) -> Directive {
    text.parse()
        .unwrap_or_else(|_| Directive::from(tracing::Level::INFO))
}

/// Logs to a file; stdout carries telemetry and stderr carries diagnostics.
///
/// Without a usable file, only warnings and errors go to stderr.
fn init_logging(log_file: Option<&Path>) {
    let path = log_file.map(Path::to_path_buf).or_else(default_log_path);

    if let Some(file) = path.as_deref().and_then(create_log_file) {
        let filter = EnvFilter::from_default_env()
            .add_directive(directive("gpslink=info"))
            .add_directive(directive("gpslink_supervisor=info"))
            .add_directive(directive("gpslink_bluez=info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("warn"))
            .with_writer(std::io::stderr)
            .init();
    }
}

// ============================================================================
// Run
// ============================================================================

/// Streams records to stdout until the link ends. Returns the exit status.
async fn stream_records(
    settings: Settings,
    capabilities: Capabilities,
    cancel: CancellationToken,
) -> u8 {
    let (sink, mut diagnostics) = DiagnosticSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(diagnostic) = diagnostics.recv().await {
            eprintln!("{diagnostic}");
        }
    });

    let supervisor =
        LinkSupervisor::new(settings.address, settings.config, capabilities, sink, cancel);
    let mut records = supervisor.spawn();
    let mut stdout = tokio::io::stdout();
    let mut streamed: u64 = 0;

    while let Some(record) = records.next().await {
        let line = format!("{}\n", record.to_json_line());
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "Stdout closed; stopping");
            break;
        }
        streamed = streamed.saturating_add(1);
    }

    let outcome = records.finish().await;
    // Every sink clone lives in the supervisor, so the printer drains and ends.
    if let Err(e) = printer.await {
        warn!(error = %e, "Diagnostic printer failed");
    }

    match outcome {
        Ok(()) => {
            info!(streamed, "Link closed");
            0
        }
        Err(e) => {
            error!(streamed, error = %e, "Link failed");
            EXIT_FAILURE
        }
    }
}

/// Validates `args`, then builds capabilities and runs the link.
async fn execute<F>(args: Args, capabilities: F, cancel: CancellationToken) -> u8
where
    F: FnOnce(&LinkConfig) -> Capabilities,
{
    let settings = match resolve_settings(&args, |var| std::env::var(var).ok()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("ERROR:{e:#}");
            return EXIT_USAGE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %settings.address,
        transport = %settings.config.transport,
        "gpslink starting"
    );

    let capabilities = capabilities(&settings.config);
    stream_records(settings, capabilities, cancel).await
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_file.as_deref());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        shutdown.cancel();
    });

    ExitCode::from(execute(args, Capabilities::host, cancel).await)
}
