//! Worker process driving one beamline device.
//!
//! Commands arrive on stdin and events leave on stdout, one JSON object per
//! line. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! beamline-worker --device tpg201 --host 192.168.1.20 --port 2002
//! echo '{"command":"end"}' | beamline-worker --config config/worker.toml
//! beamline-worker --device tpg201 --log-json 2> worker-log.jsonl
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use beamline_daq::config::{WorkerConfig, DEFAULT_CONFIG_PATH};
use beamline_daq::instrument::InstrumentCatalog;
use beamline_daq::messages::{frontend_channel, DeviceEvent, FrontendCommand};
use beamline_daq::DeviceBackend;
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beamline-worker")]
#[command(about = "Communication backend of one beamline device", long_about = None)]
struct Cli {
    /// Worker configuration file (TOML format)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Device type, overrides `[worker] device`
    #[arg(long)]
    device: Option<String>,

    /// Device address, overrides `[backend] host`
    #[arg(long)]
    host: Option<String>,

    /// TCP port, overrides `[backend] port`
    #[arg(long)]
    port: Option<u16>,

    /// Log level, overrides `[worker] log_level` (RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,

    /// Write logs as JSON lines instead of plain text
    #[arg(long)]
    log_json: bool,

    /// Print the supported device types and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let catalog = InstrumentCatalog::with_builtin();
    if cli.list_devices {
        for device_type in catalog.device_types() {
            println!("{device_type}");
        }
        return Ok(());
    }

    let mut config = WorkerConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(device) = cli.device {
        config.worker.device = device;
    }
    if let Some(host) = cli.host {
        config.backend.host = host;
    }
    if let Some(port) = cli.port {
        config.backend.port = port;
    }
    if let Some(level) = cli.log_level {
        config.worker.log_level = level;
    }
    config.validate().context("Invalid configuration")?;
    init_tracing(&config.worker.log_level, cli.log_json);

    let factory = catalog.factory(&config.worker.device)?;
    info!(
        device = %config.worker.device,
        host = %config.backend.host,
        port = config.backend.port,
        "Starting worker"
    );

    let (handle, endpoint) = frontend_channel();
    let (commands, events) = handle.into_parts();
    std::thread::Builder::new()
        .name("stdin-commands".into())
        .spawn(move || read_commands(commands))
        .context("Failed to start command reader")?;
    let writer = std::thread::Builder::new()
        .name("stdout-events".into())
        .spawn(move || write_events(events))
        .context("Failed to start event writer")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    let backend = DeviceBackend::new(factory(), config.backend, endpoint)?;
    let outcome = runtime.block_on(backend.run());
    drop(runtime);

    match writer.join() {
        Ok(result) => result.context("Failed to write events")?,
        Err(_) => warn!("Event writer thread panicked"),
    }
    outcome.context("Backend terminated with an error")?;
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Forwards JSON-line commands from stdin. EOF on stdin stops the backend.
fn read_commands(commands: mpsc::UnboundedSender<FrontendCommand>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Cannot read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FrontendCommand>(&line) {
            Ok(command) => {
                if commands.send(command).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, %line, "Ignoring malformed command"),
        }
    }
}

/// Writes every event as one JSON line until the backend drops its sender.
fn write_events(mut events: mpsc::UnboundedReceiver<DeviceEvent>) -> Result<()> {
    let stdout = std::io::stdout();
    while let Some(event) = events.blocking_recv() {
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, &event)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}
