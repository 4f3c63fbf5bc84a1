//! mlsmig - Proteus to MLS migration driver
//!
//! Runs scripted client sessions through the migration orchestrator and
//! reports the resulting conversation protocols.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mlsmig_core::MigrationConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod scenario;
mod supported_protocols;

/// mlsmig - Proteus to MLS migration driver
#[derive(Parser, Debug)]
#[command(name = "mlsmig")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to migration configuration file (defaults apply when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a scenario file through the migration orchestrator
    Simulate {
        /// Scenario file (TOML)
        scenario: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration and print it with defaults applied
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = match &cli.config {
        Some(path) => MigrationConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => MigrationConfig::default(),
    };

    match cli.command {
        Commands::Simulate { scenario, json } => commands::simulate::run(&config, &scenario, json),
        Commands::CheckConfig => commands::config::check(&config),
    }
}
