//! hearthd: the HearthGrid daemon.
//!
//! Single binary that assembles the fleet control plane:
//! - State store (redb)
//! - RAM ledger and node selection
//! - Boot admission and the start queue
//! - Workload lifecycle over Docker (local or SSH)
//! - Migration orchestrator and cost advisor
//!
//! # Usage
//!
//! ```text
//! hearthd run --config /etc/hearthgrid/hearthd.toml
//! hearthd check-config --config /etc/hearthgrid/hearthd.toml
//! ```

mod config;
mod daemon;
mod docker;
mod shell;
mod transfer;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::config::HearthConfig;

#[derive(Parser)]
#[command(name = "hearthd", about = "HearthGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run {
        /// Path to hearthd.toml.
        #[arg(long, default_value = "/etc/hearthgrid/hearthd.toml")]
        config: PathBuf,

        /// Override `daemon.data_dir` from the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Log output format.
        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Parse and validate a config file, then exit.
    CheckConfig {
        /// Path to hearthd.toml.
        #[arg(long, default_value = "/etc/hearthgrid/hearthd.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hearthd=debug,hearthgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);
            let mut loaded = HearthConfig::from_file(&config)?;
            if let Some(data_dir) = data_dir {
                loaded.daemon.data_dir = data_dir;
            }
            info!(path = ?config, nodes = loaded.nodes.len(), "configuration loaded");
            daemon::run(loaded).await
        }
        Command::CheckConfig { config } => {
            let loaded = HearthConfig::from_file(&config)?;
            println!(
                "{}: ok ({} nodes, data_dir {})",
                config.display(),
                loaded.nodes.len(),
                loaded.daemon.data_dir.display()
            );
            Ok(())
        }
    }
}
