//! linemq - unified CLI entrypoint.
//!
//! Usage:
//!   linemq start --config config/linemq.toml
//!   linemq start --backend memory --port 8809
//!   linemq config validate config/linemq.toml
//!   linemq config generate --output config/linemq.toml
//!   linemq inspect --dir data

use anyhow::Result;
use clap::Parser;
use linemq::cli::commands::{run_config, run_inspect, run_start};
use linemq::cli::{Cli, Commands};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "config/linemq.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.map(PathBuf::from);

    match cli.command {
        Commands::Start(args) => {
            run_start(
                config_path.as_deref(),
                Path::new(DEFAULT_CONFIG),
                cli.log_level,
                args,
            )
            .await
        }
        Commands::Config(args) => run_config(
            args,
            config_path.as_deref().unwrap_or(Path::new(DEFAULT_CONFIG)),
        ),
        Commands::Inspect(args) => run_inspect(args).await,
    }
}
