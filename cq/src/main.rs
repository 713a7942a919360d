//! cq - cluster-wide scatter-gather queries
//!
//! CLI entry point for running simulated cluster queries.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info};

use clusterquery::cli::{Cli, Command, OutputFormat};
use clusterquery::config::{Config, SimulationConfig};
use clusterquery::sim::{Simulation, SimulationReport};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Simulate {
            peers,
            silent,
            query,
            payload,
            timeout_ms,
            format,
        } => {
            let sim_config = SimulationConfig {
                peers: peers.unwrap_or(config.simulation.peers),
                silent_peers: silent.unwrap_or(config.simulation.silent_peers),
                latency_ms: config.simulation.latency_ms,
            };
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.query.gather_timeout());
            cmd_simulate(&sim_config, &query, &payload, timeout, format).await
        }
        Command::Config => cmd_config(&config, cli.config.as_ref()),
    }
}

/// Run one query across a simulated cluster and print what came back
async fn cmd_simulate(
    sim_config: &SimulationConfig,
    query: &str,
    payload: &str,
    timeout: Duration,
    format: OutputFormat,
) -> Result<()> {
    debug!(?sim_config, %query, ?timeout, "cmd_simulate: called");
    let simulation = Simulation::start(sim_config, query);
    let report = simulation
        .run(query, payload, timeout)
        .await
        .context("Failed to issue query")?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report).context("Failed to serialize report")?);
        }
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    let status = if report.is_complete() {
        "complete".green()
    } else {
        "partial".yellow()
    };
    println!(
        "{} {}/{} responses to '{}' in {}ms",
        status,
        report.responses.len(),
        report.expected,
        report.query_type.cyan(),
        report.elapsed_ms
    );
    for (i, response) in report.responses.iter().enumerate() {
        println!("  {} {}", format!("[{}]", i + 1).dimmed(), response);
    }
    println!(
        "{} delivered={} dropped={} answered={} unhandled={}",
        "metrics".dimmed(),
        report.metrics.responses_delivered,
        report.metrics.responses_dropped,
        report.metrics.requests_answered,
        report.metrics.requests_unhandled
    );
}

fn cmd_config(config: &Config, path: Option<&PathBuf>) -> Result<()> {
    debug!(?path, "cmd_config: called");
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
