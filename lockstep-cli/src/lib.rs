//! The `lockstep` command line
//!
//! The binary only knows `{n}.sql` steps. Applications with procedural steps
//! build their own binary around [`run`], passing the procedures they compiled
//! in:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut procedures = ProcedureRegistry::new();
//!     procedures.register(2, RenameColumn)?;
//!     lockstep_cli::run(Cli::parse(), procedures).await
//! }
//! ```

pub mod cli;
pub mod commands;

use anyhow::{Context, Result};
use lockstep_config::{ConfigLoader, LockstepConfig, LogLevel, LoggingConfig};
use lockstep_migrate::ProcedureRegistry;
use std::path::Path;
use tracing::debug;

pub use cli::{Cli, Commands, ConfigCommands, TargetArgs};

/// Load configuration, set up logging and run the selected command
pub async fn run(cli: Cli, procedures: ProcedureRegistry) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging, cli.log_level.as_deref())?;
    debug!("lockstep CLI starting");

    match &cli.command {
        Commands::Migrate { target } => {
            commands::apply_target_args(&mut config, target)?;
            commands::migrate(&config, procedures).await?;
        }
        Commands::Status { target, json } => {
            commands::apply_target_args(&mut config, target)?;
            commands::status(&config, procedures, *json).await?;
        }
        Commands::Unlock { target } => {
            commands::apply_target_args(&mut config, target)?;
            commands::unlock(&config).await?;
        }
        Commands::Config { config_cmd } => {
            commands::config_command(&config, config_cmd)?;
        }
    }

    Ok(())
}

/// Load configuration from file or environment
pub fn load_config(config_path: Option<&Path>) -> Result<LockstepConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) if !path.exists() => {
            anyhow::bail!("Configuration file not found: {}", path.display())
        }
        Some(path) => loader
            .from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

/// Initialize logging, letting `--log-level` override the configured level
fn init_logging(config: &LoggingConfig, log_level: Option<&str>) -> Result<()> {
    let mut logging_config = config.clone();
    if let Some(level) = log_level {
        logging_config.level = level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    // An embedding application's subscriber, if any, stays in place
    lockstep_logging::init_logging_from_config(&logging_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/lockstep.yaml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_invalid_cli_log_level() {
        assert!(init_logging(&LoggingConfig::default(), Some("loud")).is_err());
    }
}
