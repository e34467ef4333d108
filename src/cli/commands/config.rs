//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate a configuration file.
    Validate {
        /// Config file path. Defaults to the global --config.
        path: Option<PathBuf>,
    },
    /// Print configuration with defaults filled in.
    Show {
        /// Config file path. Defaults to the global --config.
        path: Option<PathBuf>,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Write a configuration file holding every default.
    Generate {
        /// Output file path. Prints to stdout when absent.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command. `default_path` is used when the subcommand names
/// no file.
pub fn run_config(args: ConfigArgs, default_path: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { path } => {
            validate_config(path.as_deref().unwrap_or(default_path))
        }
        ConfigCommand::Show { path, format } => {
            show_config(path.as_deref().unwrap_or(default_path), &format)
        }
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    println!("✓ {} is valid", path.display());
    if !config.cluster.is_clustered() {
        println!("  note: cluster.endpoints is empty; the node will run standalone");
    }
    if !config.storage.is_strict() {
        println!("  note: group-fsync may lose the last tick of writes on power loss");
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", config.to_toml()?),
        other => anyhow::bail!("unknown format {:?}, expected toml or json", other),
    }
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = format!("# linemq configuration\n\n{}", Config::default().to_toml()?);
    match output {
        Some(path) => {
            std::fs::write(path, &template)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Generated config template: {}", path.display());
        }
        None => println!("{}", template),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_template_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linemq.toml");
        generate_config(Some(&path)).unwrap();
        validate_config(&path).unwrap();
        show_config(&path, "json").unwrap();
        assert!(show_config(&path, "yaml").is_err());
    }
}
