//! Surge CLI - Command-line interface
//!
//! Runs deterministic swarms from the command line.

mod commands;

use anyhow::Context;
use clap::Parser;
use surge_swarm::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "surge")]
#[command(about = "Deterministic BitTorrent swarm simulator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)
        .context("failed to initialize tracing")?;

    commands::handle_command(cli.command)
}
