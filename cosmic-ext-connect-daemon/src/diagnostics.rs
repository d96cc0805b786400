//! Command line and logging
//!
//! The daemon runs by default; the other subcommands inspect the local
//! identity, the persisted devices and the effective configuration, then
//! exit.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// COSMIC Connect daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "cosmic-ext-connect-daemon")]
#[command(about = "COSMIC Connect daemon: device discovery, pairing and D-Bus export", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Omit timestamps from log lines
    #[arg(long = "no-timestamps", action = ArgAction::SetFalse)]
    pub timestamps: bool,

    /// Configuration file (defaults to the XDG config directory)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon (default)
    Run,

    /// Show the local device id and certificate fingerprint
    Identity,

    /// List persisted devices
    ListDevices {
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    DumpConfig,
}

/// Initialize logging based on CLI configuration
///
/// `RUST_LOG` takes precedence over `--log-level`.
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}
