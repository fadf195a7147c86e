//! VPN Connection Daemon (vpnctld)
//!
//! Runs one OpenVPN connection and writes every connection event to stdout
//! as a JSON line, for a UI process to consume.
//!
//! # Usage
//!
//! ```bash
//! # Connect to node 7 using the nodes directory from the config file
//! vpnctld --config /etc/vpnctl/vpnctl.toml --connect 7
//!
//! # Show the effective configuration
//! vpnctld --config /etc/vpnctl/vpnctl.toml --print-config
//! ```
//!
//! SIGINT/SIGTERM disconnect and exit; SIGHUP re-emits the current state and
//! bandwidth snapshots.

use anyhow::{bail, Context};
use clap::Parser;
use libvpnctl::config::VpnctlConfig;
use libvpnctl::vpn::common::check_binary_available;
use libvpnctl::vpn::{ConnectionController, NodeId, StartOutcome};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// VPN Connection Daemon
#[derive(Parser, Debug)]
#[command(name = "vpnctld")]
#[command(author = "vpnctl contributors")]
#[command(version)]
#[command(about = "VPN Connection Daemon - supervises OpenVPN and reports connection events", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node to connect to on startup
    #[arg(long, value_name = "NODE_ID")]
    connect: Option<NodeId>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => VpnctlConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => VpnctlConfig::default(),
    };

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Starting VPN Connection Daemon (vpnctld)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if !check_binary_available(&config.daemon.program).await {
        warn!("'{}' was not found in PATH, connections will fail", config.daemon.program);
    }

    let controller = ConnectionController::from_config(&config);
    if !controller.credentials().is_logged_in() {
        warn!("No remote session, node authorization may fail");
    }

    let mut events = controller.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Event output fell behind, {} events lost", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut failure = None;
    if let Some(node_id) = args.connect {
        match controller.start(node_id).await {
            Ok(StartOutcome::Connected { message }) => info!("{}", message),
            Ok(StartOutcome::Rejected { message }) => {
                failure = Some(format!("Connection to node {} refused: {}", node_id, message));
            }
            Err(e) => {
                error!("Failed to connect to node {}: {}", node_id, e);
                failure = Some(format!("Failed to connect to node {}: {}", node_id, e));
            }
        }
    }

    if failure.is_none() {
        if let Err(e) = handle_signals(&controller).await {
            error!("Signal handler error: {}", e);
        }
    }

    info!("Shutting down VPN Connection Daemon...");
    controller.stop().await;
    drop(controller);

    // Let the printer flush what stop() published
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Event output did not drain before exit");
    }

    if let Some(message) = failure {
        bail!(message);
    }

    info!("VPN Connection Daemon stopped");
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("vpnctld={},libvpnctl={}", log_level, log_level))
    });

    // stdout carries the event stream
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

/// Wait for SIGTERM or SIGINT; SIGHUP republishes the current snapshots
async fn handle_signals(controller: &ConnectionController) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    return Ok(());
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, republishing connection data");
                    controller.republish().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        // No SIGHUP here; only Ctrl+C ends the daemon
        let _ = controller;
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating graceful shutdown");
        Ok(())
    }
}
