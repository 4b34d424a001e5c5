//! Migration error types

use lockstep_storage::StorageError;
use thiserror::Error;

/// Result type for migration operations
pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

/// Everything that can end a migration run.
///
/// Contention on the execution lock is absent on purpose: it is waited out,
/// never reported.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The lock could not be taken for a reason other than another holder
    #[error("Failed to acquire execution lock on '{table}': {source}")]
    LockAcquisition {
        table: String,
        #[source]
        source: StorageError,
    },

    /// The tracking table or its record could not be created or read
    #[error("Failed to bootstrap tracking table '{table}': {source}")]
    Bootstrap {
        table: String,
        #[source]
        source: StorageError,
    },

    /// The step directory could not be listed or a step could not be loaded
    #[error("Failed to resolve step {ordinal}: {message}")]
    StepResolution { ordinal: u64, message: String },

    /// A step ran and failed
    #[error("Step {ordinal} failed: {source}")]
    StepExecution {
        ordinal: u64,
        #[source]
        source: anyhow::Error,
    },

    /// A step succeeded but could not be recorded as applied
    #[error("Failed to record step {ordinal} as applied: {source}")]
    VersionAdvance {
        ordinal: u64,
        #[source]
        source: StorageError,
    },

    /// The run succeeded but the lock could not be given back
    #[error("Failed to release execution lock on '{table}': {source}")]
    LockRelease {
        table: String,
        #[source]
        source: StorageError,
    },

    /// Two procedures were registered for one ordinal, or ordinal 0 was used
    #[error("Invalid procedure registration: {0}")]
    Registry(String),

    /// Storage errors outside a run (status, unlock, setup)
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MigrationError {
    /// Ordinal of the step this error belongs to, if any
    pub fn ordinal(&self) -> Option<u64> {
        match self {
            MigrationError::StepResolution { ordinal, .. }
            | MigrationError::StepExecution { ordinal, .. }
            | MigrationError::VersionAdvance { ordinal, .. } => Some(*ordinal),
            _ => None,
        }
    }

    /// The error a failing step raised, unwrapped
    pub fn step_error(&self) -> Option<&anyhow::Error> {
        match self {
            MigrationError::StepExecution { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Get error code for reports and exit statuses
    pub fn error_code(&self) -> &'static str {
        match self {
            MigrationError::LockAcquisition { .. } => "LOCK_ACQUISITION",
            MigrationError::Bootstrap { .. } => "BOOTSTRAP",
            MigrationError::StepResolution { .. } => "STEP_RESOLUTION",
            MigrationError::StepExecution { .. } => "STEP_EXECUTION",
            MigrationError::VersionAdvance { .. } => "VERSION_ADVANCE",
            MigrationError::LockRelease { .. } => "LOCK_RELEASE",
            MigrationError::Registry(_) => "REGISTRY",
            MigrationError::Storage(e) => e.error_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_is_preserved() {
        let err = MigrationError::StepExecution {
            ordinal: 2,
            source: anyhow::anyhow!("some error"),
        };

        assert_eq!(err.to_string(), "Step 2 failed: some error");
        assert_eq!(err.ordinal(), Some(2));
        assert_eq!(err.step_error().unwrap().to_string(), "some error");
        assert_eq!(err.error_code(), "STEP_EXECUTION");
    }

    #[test]
    fn test_storage_errors_keep_their_code() {
        let err: MigrationError = StorageError::MissingRecord("db_version".to_string()).into();
        assert_eq!(err.error_code(), "MISSING_RECORD");
        assert_eq!(err.ordinal(), None);
        assert!(err.step_error().is_none());
    }
}
