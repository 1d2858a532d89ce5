//! Clap derive structures for the `kasa-collector` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// kasa-collector -- smart-plug telemetry into InfluxDB
#[derive(Debug, Parser)]
#[command(
    name = "kasa-collector",
    version,
    about = "Collect power and system telemetry from Kasa smart plugs into InfluxDB",
    long_about = "Discovers Kasa plugs and power strips on the local network, polls their\n\
        energy meters and system information on fixed intervals, and writes\n\
        the readings to InfluxDB v2.\n\n\
        Settings come from defaults, an optional TOML file and\n\
        KASA_COLLECTOR_* environment variables, in that order.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Settings file (TOML). Defaults to the platform config directory.
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the collector until interrupted
    Run(RunArgs),

    /// Check that the collector is producing data
    Health,

    /// Print the effective settings (secrets obfuscated)
    Config,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Poll a built-in simulated device fleet instead of the network
    #[arg(long)]
    pub simulate: bool,
}
