//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// linemq - topic/line message queue node.
#[derive(Parser, Debug)]
#[command(name = "linemq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a queue node.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Print topic and line state from a storage directory.
    Inspect(commands::InspectArgs),
}
