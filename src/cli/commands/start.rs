//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides, StorageBackend};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start a queue node.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Storage directory (overrides storage.dir).
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Storage backend: durable or memory (overrides storage.backend).
    #[arg(long, value_parser = parse_backend)]
    pub backend: Option<StorageBackend>,

    /// Advertised port (overrides node.port).
    #[arg(long)]
    pub port: Option<u16>,
}

fn parse_backend(value: &str) -> Result<StorageBackend, String> {
    match value {
        "durable" => Ok(StorageBackend::Durable),
        "memory" => Ok(StorageBackend::Memory),
        other => Err(format!("unknown backend {:?}, expected durable or memory", other)),
    }
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // A subscriber may already be installed when embedded.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Load the config file, or defaults when no path was given and the default
/// file is absent.
pub fn load_config(path: Option<&Path>, default_path: &Path) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None if default_path.exists() => Config::from_file(default_path)
            .with_context(|| format!("failed to load config from {}", default_path.display())),
        None => Ok(Config::default()),
    }
}

/// Run the start command.
pub async fn run_start(
    config_path: Option<&Path>,
    default_path: &Path,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let mut config = load_config(config_path, default_path)?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        storage_dir: args.storage_dir,
        backend: args.backend,
        port: args.port,
    });

    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!(parse_backend("memory"), Ok(StorageBackend::Memory));
        assert_eq!(parse_backend("durable"), Ok(StorageBackend::Durable));
        assert!(parse_backend("rocks").is_err());
    }

    #[test]
    fn missing_default_file_falls_back_to_defaults() {
        let config = load_config(None, Path::new("/nonexistent/linemq.toml")).unwrap();
        assert_eq!(config.node.port, 8808);
        assert!(load_config(
            Some(Path::new("/nonexistent/linemq.toml")),
            Path::new("/nonexistent/linemq.toml")
        )
        .is_err());
    }
}
