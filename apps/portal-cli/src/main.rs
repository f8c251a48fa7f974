//! # RFID Portal CLI
//!
//! Command-line host for the portal engine.
//!
//! ## Commands
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  rfid-portal ports            list serial ports, best reader first     │
//! │  rfid-portal run [--port P]   connect, run inventory, log passages     │
//! │      [--sensor-port S]        plus a "#1"/"#2" sensor adapter          │
//! │  rfid-portal config [--init]  print (or write) the effective config    │
//! │                                                                         │
//! │  run loop:                                                              │
//! │    connect ──► start session ──► wait for Ctrl+C or link loss           │
//! │       ▲                                   │ link lost                   │
//! │       └──────── backoff 1s..30s ◄─────────┘                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use clap::{Parser, Subcommand};
use portal_core::DirectionEvent;
use portal_link::port::{best_reader_port, detect_reader_port, list_ports};
use portal_link::{
    EngineHandle, InventorySnapshot, LinkHandle, PortalConfig, PortalEngine, SensorHandle,
    SensorPort, SerialLink, SnapshotPublisher,
};
use portal_store::{InventoryStore, StopReason};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// Command Line
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "rfid-portal", version, about = "UHF RFID portal inventory and direction detection")]
struct Cli {
    /// Config file (defaults to the platform config directory).
    #[arg(short, long, global = true, env = "RFID_PORTAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List serial ports, most reader-like first.
    Ports {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Connect to the reader and run inventory until interrupted.
    Run {
        /// Serial port; overrides the config file and auto-detection.
        #[arg(short, long)]
        port: Option<String>,

        /// Port of a `#1`/`#2` sensor adapter; overrides the config file.
        #[arg(long)]
        sensor_port: Option<String>,

        /// Print passages and snapshots as JSON lines.
        #[arg(long)]
        json: bool,

        /// Exit when the link is lost instead of reconnecting.
        #[arg(long)]
        no_reconnect: bool,
    },

    /// Print the effective configuration.
    Config {
        /// Write the effective configuration to the config file.
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ports { json } => ports(json),
        Commands::Config { init } => show_config(cli.config, init),
        Commands::Run {
            port,
            sensor_port,
            json,
            no_reconnect,
        } => {
            let mut config = PortalConfig::load(cli.config).context("loading configuration")?;
            if sensor_port.is_some() {
                config.serial.sensor_port = sensor_port;
            }
            run(config, port, json, !no_reconnect).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// ports / config
// =============================================================================

fn ports(json: bool) -> Result<()> {
    let mut ports = list_ports().context("enumerating serial ports")?;
    let best = best_reader_port(&ports).map(|p| p.name.clone());
    ports.sort_by_key(|p| std::cmp::Reverse(p.reader_score()));

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in &ports {
        let marker = if best.as_deref() == Some(port.name.as_str()) { "*" } else { " " };
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
            _ => "-".into(),
        };
        println!(
            "{} {:<24} {:<10} {:<10} {}",
            marker,
            port.name,
            port.kind,
            ids,
            port.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn show_config(path: Option<PathBuf>, init: bool) -> Result<()> {
    let config = PortalConfig::load(path.clone()).context("loading configuration")?;
    if init {
        config.save(path.clone()).context("writing configuration")?;
    }

    let location = path.or_else(PortalConfig::default_config_path);
    if let Some(location) = location {
        println!("# {}", location.display());
    }
    print!("{}", config.to_toml()?);
    Ok(())
}

// =============================================================================
// run
// =============================================================================

async fn run(config: PortalConfig, port: Option<String>, json: bool, reconnect: bool) -> Result<()> {
    let port = resolve_port(port, &config)?;
    info!(port = %port, baud_rate = config.serial.baud_rate, "Using reader port");

    let store = Arc::new(InventoryStore::new(config.store_config()));
    let publisher = SnapshotPublisher::spawn(store.clone(), config.publish_interval());
    let printer = tokio::spawn(print_snapshots(publisher.subscribe(), json));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(30),
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        match connect(&port, &config, store.clone(), json).await {
            Ok((link, engine, _sensors)) => {
                backoff.reset();
                tokio::select! {
                    _ = &mut shutdown => {
                        stop(&link, &engine).await;
                        break;
                    }
                    reason = link.closed() => {
                        warn!(%reason, "Reader link lost");
                        let _ = engine.shutdown().await;
                    }
                }
            }
            Err(e) => error!(error = %format!("{:#}", e), "Reader connection failed"),
        }

        if !reconnect {
            break;
        }
        let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let last = InventorySnapshot::capture(&store);
    publisher.stop();
    printer.abort();
    info!(
        unique_tags = last.unique_tags,
        detected_tags = last.detected_tags,
        total_reads = last.total_reads,
        "Portal stopped"
    );
    Ok(())
}

fn resolve_port(cli_port: Option<String>, config: &PortalConfig) -> Result<String> {
    if let Some(port) = cli_port.or_else(|| config.serial.port.clone()) {
        return Ok(port);
    }
    match detect_reader_port().context("detecting reader port")? {
        Some(found) => {
            info!(port = %found.name, product = ?found.product, "Auto-detected reader port");
            Ok(found.name)
        }
        None => bail!("no serial port looks like a reader; pass --port or set RFID_PORTAL_PORT"),
    }
}

/// Opens the link (and the sensor adapter, if configured), starts the
/// engine and an inventory session.
async fn connect(
    port: &str,
    config: &PortalConfig,
    store: Arc<InventoryStore>,
    json: bool,
) -> Result<(LinkHandle, EngineHandle, Option<SensorHandle>)> {
    let (link, events) = SerialLink::connect(port, config.serial.baud_rate, config.link_config())
        .with_context(|| format!("opening {}", port))?;

    // Passages need the sensors, but tags are still counted without them.
    let sensors = match config.serial.sensor_port.as_deref() {
        Some(path) => match SensorPort::connect(path, config.serial.sensor_baud_rate, &link) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(port = path, error = %e, "Sensor port unavailable, running without it");
                None
            }
        },
        None => None,
    };

    let engine = PortalEngine::spawn(link.clone(), events, store, config.engine_config());
    tokio::spawn(print_passages(engine.subscribe_directions(), json));

    if let Err(e) = engine.start_session(config.reader.clone()).await {
        let _ = engine.shutdown().await;
        link.close();
        return Err(e).context("starting inventory session");
    }
    Ok((link, engine, sensors))
}

async fn stop(link: &LinkHandle, engine: &EngineHandle) {
    match engine.stop_session().await {
        Ok(status) => {
            if let Some(reason) = status.stop_reason.filter(StopReason::is_failure) {
                warn!(%reason, "Session had already failed");
            }
        }
        Err(e) => debug!(error = %e, "No session to stop"),
    }
    let _ = engine.shutdown().await;
    link.close();
}

// =============================================================================
// Output
// =============================================================================

async fn print_passages(mut passages: broadcast::Receiver<DirectionEvent>, json: bool) {
    loop {
        match passages.recv().await {
            Ok(passage) => {
                if json {
                    let line = serde_json::json!({
                        "type": "passage",
                        "id": passage.id,
                        "direction": passage.direction,
                        "first_sensor": passage.first_sensor,
                        "gap_ms": passage.trigger_gap().as_millis() as u64,
                        "tags": passage.tags,
                    });
                    println!("{}", line);
                } else {
                    let tags: Vec<String> = passage.tags.iter().map(|t| t.to_hex()).collect();
                    println!(
                        "{} passage ({} tags) {}",
                        passage.direction,
                        tags.len(),
                        tags.join(" ")
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Passage output fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_snapshots(mut snapshots: watch::Receiver<InventorySnapshot>, json: bool) {
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if json {
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Snapshot not serializable"),
            }
        } else {
            info!(
                session = %snapshot.session,
                unique_tags = snapshot.unique_tags,
                detected_tags = snapshot.detected_tags,
                total_reads = snapshot.total_reads,
                "Inventory"
            );
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping portal...");
}
