//! CLI argument parsing for the modperf demo host

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Overlay text, one block per report (default)
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "modperf")]
#[command(version)]
#[command(
    about = "Per-extension CPU time attribution, demonstrated on a simulated host",
    long_about = None
)]
pub struct Cli {
    /// Monitor configuration (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Extension display names (TOML with [[extension]] tables)
    #[arg(short = 'r', long = "registry", value_name = "FILE")]
    pub registry: Option<PathBuf>,

    /// How long the simulated host runs
    #[arg(
        short = 'd',
        long = "duration-ms",
        value_name = "MS",
        default_value = "3000"
    )]
    pub duration_ms: u64,

    /// Report interval; overrides flush_interval_ms from the config
    #[arg(long = "flush-ms", value_name = "MS")]
    pub flush_ms: Option<u64>,

    /// Host threads calling into extensions (the frame loop counts as one)
    #[arg(short = 't', long = "threads", value_name = "N", default_value = "2")]
    pub threads: usize,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Print the monitor's failure counters at exit
    #[arg(long = "diagnostics")]
    pub diagnostics: bool,

    /// Enable debug tracing output (to stderr)
    #[arg(long = "debug")]
    pub debug: bool,
}
