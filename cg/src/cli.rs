//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// cg - drive a single call group from the command line
#[derive(Parser)]
#[command(
    name = "cg",
    about = "Batch concurrent arrivals into one handler call",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Join every payload concurrently, add leaves, and report each outcome
    Run {
        /// Payloads, one join per payload
        #[arg(value_name = "PAYLOAD")]
        payloads: Vec<String>,

        /// Number of arrivals that completes the batch (overrides config)
        #[arg(short = 'n', long)]
        capacity: Option<usize>,

        /// Watchdog timeout in milliseconds, 0 disables it (overrides config)
        #[arg(short, long = "timeout-ms")]
        timeout_ms: Option<u64>,

        /// Number of signal-only arrivals
        #[arg(long, default_value_t = 0)]
        leaves: usize,

        /// Make the batch handler fail
        #[arg(long)]
        fail: bool,

        /// Delay inside the batch handler in milliseconds
        #[arg(long = "handler-delay-ms", default_value_t = 0)]
        handler_delay_ms: u64,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the effective configuration
    Config,
}

/// Output format for run results
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
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
