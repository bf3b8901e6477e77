//! WgLedger Daemon
//!
//! Keeps the traffic counters current and optionally enforces account
//! expiry against the live tunnel interface.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgledger_common::LifecycleCoordinator;

mod config;
mod reconciler;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "wgledgerd")]
#[command(about = "WgLedger daemon - traffic accounting and expiry enforcement")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WGLEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,

    /// Run a single sync (and sweep, if enabled) then exit
    #[arg(long)]
    once: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("WgLedger daemon v{}", wgledger_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(wgledger_common::default_config_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(data_dir) = cli.data_dir {
        config.ledger.data_dir = data_dir;
    }

    if cli.write_config {
        config.save(&config_path)?;
        info!("Wrote configuration to {:?}", config_path);
        return Ok(());
    }

    tokio::fs::create_dir_all(&config.ledger.data_dir).await?;
    info!(
        "Managing {} on {} (data in {:?})",
        config.ledger.server_config.display(),
        config.ledger.runtime.interface,
        config.ledger.data_dir
    );

    let coordinator = Arc::new(LifecycleCoordinator::from_config(config.ledger.clone())?);
    let reconciler = reconciler::Reconciler::new(coordinator, config.daemon.clone());

    if cli.once {
        let report = reconciler.sync_once().await?;
        info!("Synced {} peers", report.updated.len());
        if config.daemon.enforce_expiry {
            reconciler.sweep_once(chrono::Utc::now()).await?;
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reconciler_handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    // Wait for shutdown signal
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_handle.await {
        tracing::error!("Reconciler error: {}", e);
    }

    info!("Daemon shutdown complete");
    Ok(())
}
