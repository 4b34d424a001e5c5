//! Command implementations

use anyhow::{bail, Context, Result};
use colored::Colorize;
use lockstep_config::LockstepConfig;
use lockstep_migrate::{MigrationReport, MigrationStatus, Migrator, ProcedureRegistry};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::cli::{ConfigCommands, TargetArgs};

/// Apply command-line target overrides and re-validate
pub fn apply_target_args(config: &mut LockstepConfig, target: &TargetArgs) -> Result<()> {
    if let Some(url) = &target.database_url {
        config.database.url = url.clone();
    }
    if let Some(table) = &target.tracking_table {
        config.migrations.tracking_table = table.clone();
    }
    if let Some(directory) = &target.step_directory {
        config.migrations.step_directory = directory.clone();
    }

    config
        .validate_all()
        .context("Invalid configuration after command-line overrides")
}

async fn build_migrator(
    config: &LockstepConfig,
    procedures: ProcedureRegistry,
) -> Result<Migrator> {
    let db = lockstep_storage::connect(&config.database)
        .await
        .context("Failed to connect to database")?;

    Ok(Migrator::from_config(db, &config.migrations, procedures)?)
}

/// Apply every pending step and print what was done
pub async fn migrate(
    config: &LockstepConfig,
    procedures: ProcedureRegistry,
) -> Result<MigrationReport> {
    let migrator = build_migrator(config, procedures).await?;
    info!(
        directory = %config.migrations.step_directory.display(),
        table = %config.migrations.tracking_table,
        "Starting migration run"
    );

    let report = migrator.run().await?;
    print_report(&report);
    Ok(report)
}

fn print_report(report: &MigrationReport) {
    if report.is_noop() {
        println!(
            "{} already at version {}",
            "✓".green(),
            report.final_version.to_string().bold()
        );
        return;
    }

    for step in &report.applied {
        println!(
            "  {} step {} ({}) in {:?}",
            "applied".green(),
            step.ordinal.to_string().bold(),
            step.kind,
            step.elapsed
        );
    }
    println!(
        "{} migrated from version {} to {}",
        "✓".green(),
        report.starting_version,
        report.final_version.to_string().bold()
    );
}

#[derive(Debug, Serialize)]
struct StatusView<'a> {
    tracking_table: &'a str,
    version: u64,
    running: bool,
    pending: Vec<PendingView<'a>>,
}

#[derive(Debug, Serialize)]
struct PendingView<'a> {
    ordinal: u64,
    kind: String,
    description: &'a str,
}

/// Show the tracking record and pending steps
pub async fn status(
    config: &LockstepConfig,
    procedures: ProcedureRegistry,
    json: bool,
) -> Result<MigrationStatus> {
    let migrator = build_migrator(config, procedures).await?;
    let status = migrator.status().await?;

    if json {
        println!("{}", render_status_json(&status)?);
    } else {
        print_status(&status);
    }

    Ok(status)
}

fn render_status_json(status: &MigrationStatus) -> Result<String> {
    let view = StatusView {
        tracking_table: &status.table,
        version: status.record.version,
        running: status.record.running,
        pending: status
            .pending
            .iter()
            .map(|p| PendingView {
                ordinal: p.ordinal,
                kind: p.kind.to_string(),
                description: &p.description,
            })
            .collect(),
    };

    serde_json::to_string_pretty(&view).context("Failed to format status as JSON")
}

fn print_status(status: &MigrationStatus) {
    println!("{} {}", "Tracking table:".bold(), status.table);
    println!("{} {}", "Version:".bold(), status.record.version);

    if status.record.running {
        println!(
            "{} {}",
            "Lock:".bold(),
            "held (a run is in progress, or one died; see `lockstep unlock`)".yellow()
        );
    } else {
        println!("{} {}", "Lock:".bold(), "free".green());
    }

    if status.pending.is_empty() {
        println!("{} none", "Pending:".bold());
        return;
    }

    println!("{}", "Pending:".bold());
    for step in &status.pending {
        println!(
            "  {:>4}  {:<11}  {}",
            step.ordinal, step.kind, step.description
        );
    }
}

/// Clear a stale execution lock
pub async fn unlock(config: &LockstepConfig) -> Result<bool> {
    let migrator = build_migrator(config, ProcedureRegistry::new()).await?;
    let was_set = migrator.force_unlock().await?;

    if was_set {
        println!(
            "{} cleared execution lock on '{}'",
            "✓".green(),
            config.migrations.tracking_table
        );
    } else {
        println!(
            "execution lock on '{}' was not held",
            config.migrations.tracking_table
        );
    }

    Ok(was_set)
}

/// Handle configuration subcommands
pub fn config_command(config: &LockstepConfig, command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show { format } => {
            println!("{}", render_config(config, format)?);
            Ok(())
        }
        ConfigCommands::Generate { output, force } => match output {
            Some(path) => write_sample(path, *force),
            None => {
                print!("{}", LockstepConfig::generate_sample());
                Ok(())
            }
        },
    }
}

fn render_config(config: &LockstepConfig, format: &str) -> Result<String> {
    match format.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::to_string(config).context("Failed to format config as YAML"),
        "json" => serde_json::to_string_pretty(config).context("Failed to format config as JSON"),
        other => bail!("Unsupported format '{}', expected yaml or json", other),
    }
}

fn write_sample(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite",
            path.display()
        );
    }

    std::fs::write(path, LockstepConfig::generate_sample())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(path = %path.display(), "Wrote sample configuration");
    println!("{} wrote {}", "✓".green(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_migrate::{PendingStep, StepKind, VersionRecord};

    #[test]
    fn test_target_args_override_config() {
        let mut config = LockstepConfig::default();
        let target = TargetArgs {
            database_url: Some("sqlite://other.db?mode=rwc".to_string()),
            tracking_table: Some("schema_version".to_string()),
            step_directory: None,
        };

        apply_target_args(&mut config, &target).unwrap();
        assert_eq!(config.database.url, "sqlite://other.db?mode=rwc");
        assert_eq!(config.migrations.tracking_table, "schema_version");
        assert_eq!(
            config.migrations.step_directory,
            std::path::PathBuf::from(lockstep_config::DEFAULT_STEP_DIRECTORY)
        );
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = LockstepConfig::default();
        let target = TargetArgs {
            tracking_table: Some("drop table".to_string()),
            ..Default::default()
        };

        assert!(apply_target_args(&mut config, &target).is_err());
    }

    #[test]
    fn test_status_json_shape() {
        let status = MigrationStatus {
            table: "db_version".to_string(),
            record: VersionRecord {
                version: 3,
                running: false,
            },
            pending: vec![PendingStep {
                ordinal: 4,
                kind: StepKind::Declarative,
                description: "dbmigration/4.sql".to_string(),
            }],
        };

        let rendered: serde_json::Value =
            serde_json::from_str(&render_status_json(&status).unwrap()).unwrap();
        assert_eq!(rendered["version"], 3);
        assert_eq!(rendered["running"], false);
        assert_eq!(rendered["pending"][0]["ordinal"], 4);
        assert_eq!(rendered["pending"][0]["kind"], "declarative");
    }

    #[test]
    fn test_render_config_formats() {
        let config = LockstepConfig::default();
        assert!(render_config(&config, "yaml").unwrap().contains("tracking_table"));
        assert!(render_config(&config, "JSON").unwrap().contains("\"tracking_table\""));
        assert!(render_config(&config, "toml").is_err());
    }

    #[test]
    fn test_write_sample_refuses_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lockstep.yaml");

        write_sample(&path, false).unwrap();
        assert!(write_sample(&path, false).is_err());
        write_sample(&path, true).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let parsed: LockstepConfig = serde_yaml::from_str(&written).unwrap();
        assert_eq!(parsed.migrations.tracking_table, "db_version");
    }
}
