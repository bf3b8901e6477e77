//! WgLedger CLI - Main Entry Point
//!
//! Operator interface for provisioning WireGuard peers, managing account
//! expiry and reading traffic statistics.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::{archive, expiry, stats, user};
use context::Context;

/// WgLedger CLI - WireGuard peer and account management
#[derive(Parser)]
#[command(name = "wgledger")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WGLEDGER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage users
    #[command(subcommand)]
    User(user::UserCommands),

    /// Manage account expiry
    #[command(subcommand)]
    Expiry(expiry::ExpiryCommands),

    /// Traffic statistics
    #[command(subcommand)]
    Stats(stats::StatsCommands),

    /// Removed users
    #[command(subcommand)]
    Archive(archive::ArchiveCommands),

    /// Show or initialise the configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Re-read the server config into the live interface
    Reload,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the effective configuration to the config path
    Init,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let load = || Context::load(cli.config.as_deref(), cli.data_dir.as_deref());

    match cli.command {
        Commands::User(cmd) => user::execute(cmd, &load()?, cli.format)?,
        Commands::Expiry(cmd) => expiry::execute(cmd, &load()?, cli.format)?,
        Commands::Stats(cmd) => stats::execute(cmd, &load()?, cli.format)?,
        Commands::Archive(cmd) => archive::execute(cmd, &load()?, cli.format)?,
        Commands::Config(ConfigCommands::Show) => {
            let ctx = load()?;
            println!("# {}", ctx.config_path.display());
            println!("{}", toml::to_string_pretty(ctx.config())?);
        }
        Commands::Config(ConfigCommands::Init) => {
            let ctx = load()?;
            ctx.config().save(&ctx.config_path)?;
            output::print_success(&format!(
                "Configuration written to {}",
                ctx.config_path.display()
            ));
        }
        Commands::Reload => {
            let ctx = load()?;
            ctx.coordinator.reload_runtime()?;
            output::print_success(&format!(
                "Interface {} reloaded from {}",
                ctx.config().runtime.interface,
                ctx.config().server_config.display()
            ));
        }
        Commands::Version => {
            println!("WgLedger CLI v{}", wgledger_common::VERSION);
        }
    }

    Ok(())
}
