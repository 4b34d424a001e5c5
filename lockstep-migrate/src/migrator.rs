//! Migration orchestrator
//!
//! A run moves through
//!
//! ```text
//! Idle -> LockPending -> Initializing -> Running(n) -> Advancing(n) -> Running(n+1) ...
//!                                                  \-> Completed | Failed
//! ```
//!
//! Every run that gets the lock gives it back, whatever happens after,
//! including the run's future being dropped part way through.

use lockstep_config::MigrationsConfig;
use lockstep_resilience::{RetryExecutor, RetryPolicy};
use lockstep_storage::{
    DatabaseConnection, ExecutionLock, FlagLock, LockToken, StorageError, TrackingTable,
    VersionRecord,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{MigrationError, MigrationResult};
use crate::executor::StepExecutor;
use crate::source::{DirectoryStepSource, StepSource};
use crate::step::{ProceduralStep, ProcedureRegistry, StepKind};

/// Where a run is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LockPending,
    Initializing,
    Running(u64),
    Advancing(u64),
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::LockPending => write!(f, "lock-pending"),
            RunState::Initializing => write!(f, "initializing"),
            RunState::Running(n) => write!(f, "running({})", n),
            RunState::Advancing(n) => write!(f, "advancing({})", n),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// A step applied during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    pub ordinal: u64,
    pub kind: StepKind,
    pub elapsed: Duration,
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version found once the lock was held
    pub starting_version: u64,

    /// Version recorded when the run finished
    pub final_version: u64,

    /// Steps applied, in order
    pub applied: Vec<AppliedStep>,
}

impl MigrationReport {
    /// Whether the run found nothing to do
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// A step waiting to be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStep {
    pub ordinal: u64,
    pub kind: StepKind,
    pub description: String,
}

/// Tracking state plus what the next run would apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub table: String,
    pub record: VersionRecord,
    pub pending: Vec<PendingStep>,
}

/// Applies steps to one target, one run at a time across all processes
pub struct Migrator {
    db: DatabaseConnection,
    table: TrackingTable,
    lock: FlagLock,
    bootstrap_retry: RetryExecutor,
    source: Box<dyn StepSource>,
    executor: StepExecutor,
}

impl fmt::Debug for Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("table", &self.table.name())
            .finish_non_exhaustive()
    }
}

impl Migrator {
    /// Start configuring a migrator for the database behind `db`
    pub fn builder(db: DatabaseConnection) -> MigratorBuilder {
        MigratorBuilder::new(db)
    }

    /// Build from loaded configuration plus the procedures compiled into the
    /// caller
    pub fn from_config(
        db: DatabaseConnection,
        config: &MigrationsConfig,
        procedures: ProcedureRegistry,
    ) -> MigrationResult<Self> {
        Self::builder(db)
            .tracking_table(config.tracking_table.clone())
            .step_directory(config.step_directory.clone())
            .lock_retry(config.lock_retry.clone())
            .procedures(procedures)
            .build()
    }

    pub fn tracking_table(&self) -> &TrackingTable {
        &self.table
    }

    /// Apply every step after the recorded version, in order, stopping at
    /// the first ordinal with no step.
    ///
    /// Waits without limit while another runner holds the lock. Wrap the
    /// call in a timeout to bound the wait; if the returned future is dropped
    /// after the lock was taken, the lock is released on a background task.
    pub async fn run(&self) -> MigrationResult<MigrationReport> {
        let span = info_span!("migration_run", table = %self.table.name());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> MigrationResult<MigrationReport> {
        self.transition(RunState::Idle);
        self.transition(RunState::LockPending);

        // The flag lives in the tracking row, so the row has to exist first
        self.bootstrap_retry
            .execute(|_| self.table.ensure_exists(&self.db))
            .await
            .map_err(|source| {
                self.transition(RunState::Failed);
                MigrationError::Bootstrap {
                    table: self.table.name().to_string(),
                    source,
                }
            })?;

        let token = self.lock.acquire(&self.db).await.map_err(|source| {
            self.transition(RunState::Failed);
            MigrationError::LockAcquisition {
                table: self.table.name().to_string(),
                source,
            }
        })?;

        let held = HeldLock::new(self.db.clone(), self.lock.clone(), token);

        self.transition(RunState::Initializing);
        let outcome = self.apply_pending().await;
        self.finish(held, outcome).await
    }

    /// Give the lock back and decide which error, if any, the caller sees
    async fn finish(
        &self,
        held: HeldLock,
        outcome: MigrationResult<MigrationReport>,
    ) -> MigrationResult<MigrationReport> {
        let released = held.release().await;

        match (outcome, released) {
            (Ok(report), Ok(())) => {
                self.transition(RunState::Completed);
                info!(
                    from = report.starting_version,
                    to = report.final_version,
                    applied = report.applied.len(),
                    "Migration complete"
                );
                Ok(report)
            }
            (Ok(_), Err(source)) => {
                self.transition(RunState::Failed);
                Err(MigrationError::LockRelease {
                    table: self.table.name().to_string(),
                    source,
                })
            }
            (Err(err), Ok(())) => {
                self.transition(RunState::Failed);
                error!(error = %err, "Migration failed");
                Err(err)
            }
            (Err(err), Err(release_err)) => {
                self.transition(RunState::Failed);
                error!(
                    error = %err,
                    release_error = %release_err,
                    "Migration failed and the execution lock could not be released"
                );
                Err(err)
            }
        }
    }

    async fn apply_pending(&self) -> MigrationResult<MigrationReport> {
        let starting_version = self.table.read_version(&self.db).await.map_err(|source| {
            MigrationError::Bootstrap {
                table: self.table.name().to_string(),
                source,
            }
        })?;
        debug!(version = starting_version, "Read current version");

        let mut applied = Vec::new();
        let mut ordinal = next_ordinal(starting_version)?;

        loop {
            self.transition(RunState::Running(ordinal));

            let Some(step) = self.source.resolve(ordinal).await? else {
                debug!(ordinal, "No step found, nothing further to apply");
                break;
            };

            info!(ordinal, kind = %step.kind(), step = %step.describe(), "Applying step");
            let started = Instant::now();
            self.executor.execute(&step, &self.db).await?;

            self.transition(RunState::Advancing(ordinal));
            self.table
                .advance_version(&self.db, ordinal)
                .await
                .map_err(|source| MigrationError::VersionAdvance { ordinal, source })?;

            let elapsed = started.elapsed();
            info!(ordinal, elapsed_ms = elapsed.as_millis() as u64, "Step applied");
            applied.push(AppliedStep {
                ordinal,
                kind: step.kind(),
                elapsed,
            });

            ordinal = next_ordinal(ordinal)?;
        }

        Ok(MigrationReport {
            starting_version,
            final_version: ordinal - 1,
            applied,
        })
    }

    /// Tracking record and pending steps, read without taking the lock.
    ///
    /// Creates the tracking table if it is missing.
    pub async fn status(&self) -> MigrationResult<MigrationStatus> {
        self.table
            .ensure_exists(&self.db)
            .await
            .map_err(|source| MigrationError::Bootstrap {
                table: self.table.name().to_string(),
                source,
            })?;
        let record = self.table.read_record(&self.db).await?;

        let mut pending = Vec::new();
        let mut ordinal = next_ordinal(record.version)?;
        while let Some(step) = self.source.resolve(ordinal).await? {
            pending.push(PendingStep {
                ordinal,
                kind: step.kind(),
                description: step.describe(),
            });
            ordinal = next_ordinal(ordinal)?;
        }

        Ok(MigrationStatus {
            table: self.table.name().to_string(),
            record,
            pending,
        })
    }

    /// Clear a `running` flag left behind by a runner that died holding it.
    ///
    /// Only safe when no runner is alive. Returns whether the flag was set.
    pub async fn force_unlock(&self) -> MigrationResult<bool> {
        Ok(self.lock.force_release(&self.db).await?)
    }

    fn transition(&self, state: RunState) {
        debug!(state = %state, "Migration state");
    }
}

/// The lock held by a run in progress.
///
/// Dropped without [`release`](Self::release) completing, it clears the flag
/// on a spawned task, so a cancelled run does not leave the target locked.
struct HeldLock {
    db: DatabaseConnection,
    lock: FlagLock,
    token: Option<LockToken>,
    armed: bool,
}

impl HeldLock {
    fn new(db: DatabaseConnection, lock: FlagLock, token: LockToken) -> Self {
        Self {
            db,
            lock,
            token: Some(token),
            armed: true,
        }
    }

    async fn release(mut self) -> Result<(), StorageError> {
        let result = match self.token.take() {
            Some(token) => self.lock.release(&self.db, token).await,
            None => Ok(()),
        };
        self.armed = false;
        result
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let table = self.lock.table().name().to_string();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                table = %table,
                "Run abandoned outside a runtime; execution lock left set, see `lockstep unlock`"
            );
            return;
        };

        warn!(table = %table, "Run abandoned while holding the execution lock, releasing it");
        let db = self.db.clone();
        let lock = self.lock.clone();
        runtime.spawn(async move {
            if let Err(e) = lock.force_release(&db).await {
                error!(table = %table, error = %e, "Failed to release abandoned execution lock");
            }
        });
    }
}

fn next_ordinal(version: u64) -> MigrationResult<u64> {
    version.checked_add(1).ok_or_else(|| {
        MigrationError::Storage(StorageError::VersionConflict(format!(
            "version {} cannot be advanced",
            version
        )))
    })
}

/// Builder for [`Migrator`]
pub struct MigratorBuilder {
    db: DatabaseConnection,
    tracking_table: String,
    step_directory: PathBuf,
    lock_retry: RetryPolicy,
    procedures: ProcedureRegistry,
    source: Option<Box<dyn StepSource>>,
    registry_error: Option<MigrationError>,
}

impl MigratorBuilder {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            tracking_table: lockstep_config::DEFAULT_TRACKING_TABLE.to_string(),
            step_directory: PathBuf::from(lockstep_config::DEFAULT_STEP_DIRECTORY),
            lock_retry: RetryPolicy::default(),
            procedures: ProcedureRegistry::new(),
            source: None,
            registry_error: None,
        }
    }

    pub fn tracking_table(mut self, name: impl Into<String>) -> Self {
        self.tracking_table = name.into();
        self
    }

    /// Directory holding `{n}.sql` files, relative to the working directory
    pub fn step_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.step_directory = directory.into();
        self
    }

    pub fn lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }

    /// Register a procedural step. A duplicate ordinal fails [`build`](Self::build).
    pub fn procedure<P>(mut self, ordinal: u64, procedure: P) -> Self
    where
        P: ProceduralStep + 'static,
    {
        self.add_procedure(ordinal, Arc::new(procedure));
        self
    }

    /// Register every procedure in `procedures`
    pub fn procedures(mut self, procedures: ProcedureRegistry) -> Self {
        for ordinal in procedures.ordinals() {
            if let Some(procedure) = procedures.get(ordinal) {
                self.add_procedure(ordinal, procedure);
            }
        }
        self
    }

    /// Replace the directory-backed source. `step_directory` and the
    /// registered procedures are then unused.
    pub fn source(mut self, source: impl StepSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    fn add_procedure(&mut self, ordinal: u64, procedure: Arc<dyn ProceduralStep>) {
        if self.registry_error.is_some() {
            return;
        }
        if let Err(e) = self.procedures.register_arc(ordinal, procedure) {
            self.registry_error = Some(e);
        }
    }

    pub fn build(self) -> MigrationResult<Migrator> {
        if let Some(err) = self.registry_error {
            return Err(err);
        }

        let table = TrackingTable::new(self.tracking_table)?;
        let source = match self.source {
            Some(source) => source,
            None => Box::new(DirectoryStepSource::new(
                self.step_directory,
                self.procedures,
            )),
        };

        Ok(Migrator {
            db: self.db,
            lock: FlagLock::new(table.clone(), self.lock_retry.clone()),
            bootstrap_retry: RetryExecutor::new(self.lock_retry),
            executor: StepExecutor::new(table.name()),
            table,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepContext;
    use async_trait::async_trait;
    use lockstep_storage::testing::TestDatabase;

    struct Noop;

    #[async_trait]
    impl ProceduralStep for Noop {
        async fn apply(&self, _ctx: &StepContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Running(3).to_string(), "running(3)");
        assert_eq!(RunState::Advancing(3).to_string(), "advancing(3)");
        assert_eq!(RunState::LockPending.to_string(), "lock-pending");
    }

    #[test]
    fn test_next_ordinal_overflow() {
        assert_eq!(next_ordinal(0).unwrap(), 1);
        assert!(next_ordinal(u64::MAX).is_err());
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_table_name() {
        let db = TestDatabase::new().await.unwrap();
        let err = Migrator::builder(db.connection.clone())
            .tracking_table("bad name")
            .build()
            .unwrap_err();

        assert!(matches!(
            err,
            MigrationError::Storage(StorageError::InvalidTableName(_))
        ));
    }

    #[tokio::test]
    async fn test_builder_rejects_duplicate_procedure() {
        let db = TestDatabase::new().await.unwrap();
        let err = Migrator::builder(db.connection.clone())
            .procedure(1, Noop)
            .procedure(1, Noop)
            .build()
            .unwrap_err();

        assert!(matches!(err, MigrationError::Registry(_)));
    }

    #[tokio::test]
    async fn test_from_config_uses_configured_table() {
        let db = TestDatabase::new().await.unwrap();
        let config = MigrationsConfig {
            tracking_table: "app_version".to_string(),
            step_directory: db.dir().to_path_buf(),
            ..Default::default()
        };

        let migrator =
            Migrator::from_config(db.connection.clone(), &config, ProcedureRegistry::new())
                .unwrap();
        assert_eq!(migrator.tracking_table().name(), "app_version");

        let report = migrator.run().await.unwrap();
        assert!(report.is_noop());
        assert!(db.table_exists("app_version").await.unwrap());
    }

    #[tokio::test]
    async fn test_status_lists_pending_steps() {
        let db = TestDatabase::new().await.unwrap();
        std::fs::write(db.dir().join("1.sql"), "CREATE TABLE a (id INTEGER)").unwrap();
        std::fs::write(db.dir().join("2.sql"), "CREATE TABLE b (id INTEGER)").unwrap();

        let migrator = Migrator::builder(db.connection.clone())
            .step_directory(db.dir())
            .procedure(3, Noop)
            .build()
            .unwrap();

        let status = migrator.status().await.unwrap();
        assert_eq!(status.record.version, 0);
        assert!(!status.record.running);
        assert_eq!(
            status.pending.iter().map(|p| p.ordinal).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(status.pending[2].kind, StepKind::Procedural);

        migrator.run().await.unwrap();
        assert!(migrator.status().await.unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn test_force_unlock_clears_stale_flag() {
        let db = TestDatabase::new().await.unwrap();
        let migrator = Migrator::builder(db.connection.clone())
            .step_directory(db.dir())
            .build()
            .unwrap();

        migrator.status().await.unwrap();
        db.execute("UPDATE \"db_version\" SET running = 1 WHERE id = 1")
            .await
            .unwrap();

        assert!(migrator.force_unlock().await.unwrap());
        assert!(!migrator.force_unlock().await.unwrap());
        assert!(!migrator.status().await.unwrap().record.running);
    }
}
