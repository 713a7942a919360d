//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cq - cluster-wide scatter-gather queries
#[derive(Parser, Debug)]
#[command(
    name = "cq",
    about = "Cluster-wide scatter-gather queries over a pub/sub bus",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Issue one query across an in-process simulated cluster
    Simulate {
        /// Number of nodes, including the querying one
        #[arg(short, long)]
        peers: Option<usize>,

        /// Nodes that never answer
        #[arg(short, long)]
        silent: Option<usize>,

        /// Query type to issue
        #[arg(short, long, default_value = "ping")]
        query: String,

        /// Query payload
        #[arg(long, default_value = "")]
        payload: String,

        /// Gather timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config,
}

/// Output format for simulation reports
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
