//! nodeprobe
//!
//! One-shot hardware probe for GPU inference nodes. Collects GPU, CPU/PCIe,
//! disk (fio and GPU Direct Storage) and NIC/RDMA facts, prints them as a
//! JSON report on stdout and follows with an LMCache sizing recommendation.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use nodeprobe_core::metrics::MetricsRegistry;
use nodeprobe_core::recommend::recommend;
use nodeprobe_core::{DiagnosticReport, Diagnostics, ShellRunner};
use nodeprobe_gds::CufileBackend;

/// Initialize the tracing/logging subsystem
///
/// Logs go to stderr; stdout carries the report only.
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::from_file(&cli.config)?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, aborting probe run");
        }
        _ = terminate => {
            info!("Received SIGTERM, aborting probe run");
        }
    }
}

fn print_report(report: &DiagnosticReport, config: &Config, cli: &Cli) -> Result<()> {
    let json = report
        .to_json(!cli.compact)
        .context("Failed to serialize diagnostic report")?;
    println!("{}", json);

    let recommendation = recommend(report, &config.recommend);
    recommendation.record_metrics(&MetricsRegistry::new());
    println!("\n\n{}\n\n", recommendation);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting nodeprobe");

    let config = load_config(&cli)?;

    let runner = match config.command_timeout {
        Some(timeout) => {
            info!(timeout = ?timeout, "Bounding external commands");
            ShellRunner::with_timeout(timeout)
        }
        None => ShellRunner::new(),
    };
    let diagnostics = Diagnostics::new(
        Arc::new(runner),
        Arc::new(CufileBackend::new()),
        config.probes.clone(),
    );

    // Dropping the run future releases scratch directories and files
    let report = tokio::select! {
        report = diagnostics.run() => report,
        _ = shutdown_signal() => {
            warn!("Probe run interrupted, no report produced");
            return Ok(());
        }
    };

    print_report(&report, &config, &cli)?;

    if let Some(path) = cli.metrics_file.as_ref().or(config.metrics.textfile.as_ref()) {
        match MetricsRegistry::new().write_textfile(path) {
            Ok(()) => info!(path = ?path, "Wrote metrics textfile"),
            Err(e) => warn!(path = ?path, error = %e, "Failed to write metrics textfile"),
        }
    }

    info!(errors = report.errors.len(), "nodeprobe finished");
    Ok(())
}
