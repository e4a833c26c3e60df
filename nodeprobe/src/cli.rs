//! CLI argument parsing for nodeprobe

use std::path::PathBuf;

use clap::Parser;

/// Node hardware probe - GPU, CPU, disk and NIC inventory with LMCache sizing
#[derive(Debug, Parser)]
#[command(name = "nodeprobe")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/nodeprobe/config.yaml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "NODEPROBE_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "NODEPROBE_LOG_JSON")]
    pub log_json: bool,

    /// Write Prometheus text exposition to this file after the run
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print the report as single-line JSON
    #[arg(long)]
    pub compact: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
