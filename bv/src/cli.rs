//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// BrokerView - broker management session coordinator
#[derive(Parser)]
#[command(
    name = "bv",
    about = "Management session coordinator for message brokers",
    version,
    after_help = "Logs are written to: ~/.local/share/brokerview/logs/brokerview.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Open a management session and print what the coordinator reports
    ///
    /// Runs against the built-in simulated broker.
    Connect {
        /// Broker address (defaults to the configured address)
        address: Option<String>,

        /// Connection options (defaults to the configured options)
        connection_options: Option<String>,

        /// Session options (defaults to the configured options)
        session_options: Option<String>,

        /// Class to query once connected (repeatable)
        #[arg(long = "class", value_name = "CLASS")]
        classes: Vec<String>,

        /// How long to stay connected, in seconds
        #[arg(short, long, default_value = "5")]
        duration_secs: u64,
    },

    /// Print the effective configuration
    ShowConfig {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Output format for show-config
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: yaml or json", s)),
        }
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("brokerview")
        .join("logs")
        .join("brokerview.log")
}
