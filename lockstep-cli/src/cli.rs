//! CLI argument parsing definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lockstep", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply every pending migration step
    Migrate {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show the applied version, the lock flag and pending steps
    Status {
        #[command(flatten)]
        target: TargetArgs,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clear the execution lock left behind by a runner that died
    Unlock {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

/// Overrides for the migration target, applied on top of the configuration
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Database URL (example: sqlite://app.db?mode=rwc)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Name of the version tracking table
    #[arg(long, value_name = "NAME")]
    pub tracking_table: Option<String>,

    /// Directory containing <n>.sql step files
    #[arg(long, value_name = "PATH")]
    pub step_directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Output format (yaml, json)
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output file path
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}
