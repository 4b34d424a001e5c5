//! Migration run configuration

use crate::error::ConfigResult;
use crate::validation::{validate_identifier, validate_required_string, Validatable};
use lockstep_resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Table that holds the version record when none is configured
pub const DEFAULT_TRACKING_TABLE: &str = "db_version";

/// Step directory when none is configured, relative to the working directory
pub const DEFAULT_STEP_DIRECTORY: &str = "./dbmigration";

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Name of the single-row version tracking table
    #[serde(default = "default_tracking_table")]
    pub tracking_table: String,

    /// Directory containing `<n>.sql` step files
    #[serde(default = "default_step_directory")]
    pub step_directory: PathBuf,

    /// Backoff used while another runner holds the lock
    #[serde(default)]
    pub lock_retry: RetryPolicy,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            tracking_table: default_tracking_table(),
            step_directory: default_step_directory(),
            lock_retry: RetryPolicy::default(),
        }
    }
}

impl Validatable for MigrationsConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_identifier(&self.tracking_table, "tracking_table", self.domain_name())?;
        validate_required_string(
            &self.step_directory.to_string_lossy(),
            "step_directory",
            self.domain_name(),
        )?;

        if self.lock_retry.initial_delay.is_zero() {
            return Err(self.validation_error("lock_retry.initial_delay must be greater than 0"));
        }
        if self.lock_retry.max_delay < self.lock_retry.initial_delay {
            return Err(self.validation_error(
                "lock_retry.max_delay must not be shorter than lock_retry.initial_delay",
            ));
        }
        if let lockstep_resilience::BackoffStrategy::Exponential { base } =
            self.lock_retry.backoff_strategy
        {
            if !(base >= 1.0 && base.is_finite()) {
                return Err(self.validation_error(format!(
                    "lock_retry exponential base must be a finite number >= 1.0, got {}",
                    base
                )));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "migrations"
    }
}

fn default_tracking_table() -> String {
    DEFAULT_TRACKING_TABLE.to_string()
}

fn default_step_directory() -> PathBuf {
    PathBuf::from(DEFAULT_STEP_DIRECTORY)
}
