//! Running a single step

use anyhow::Context;
use sea_orm::{ConnectionTrait, DatabaseConnection};
use tracing::{debug, info_span, Instrument};

use crate::error::{MigrationError, MigrationResult};
use crate::step::{Step, StepContext, StepLog};

/// Runs steps against the database of one migration target.
///
/// Nothing is rolled back here; a step that needs atomicity opens its own
/// transaction.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    table: String,
}

impl StepExecutor {
    /// `table` names the target in the spans steps log under
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub async fn execute(&self, step: &Step, db: &DatabaseConnection) -> MigrationResult<()> {
        let ordinal = step.ordinal();
        let span = info_span!(
            "migration_step",
            table = %self.table,
            ordinal,
            kind = %step.kind()
        );

        let result = match step {
            Step::Procedural { procedure, .. } => {
                let ctx = StepContext::new(db, StepLog::new(span.clone()), ordinal);
                procedure.apply(&ctx).instrument(span).await
            }
            Step::Declarative { path, sql, .. } => {
                Self::execute_sql(db, sql, path).instrument(span).await
            }
        };

        result.map_err(|source| MigrationError::StepExecution { ordinal, source })
    }

    async fn execute_sql(
        db: &DatabaseConnection,
        sql: &str,
        path: &std::path::Path,
    ) -> anyhow::Result<()> {
        if sql.trim().is_empty() {
            debug!(path = %path.display(), "Declarative step is empty");
            return Ok(());
        }

        db.execute_unprepared(sql)
            .await
            .with_context(|| format!("executing {}", path.display()))?;

        debug!(path = %path.display(), "Declarative step executed");
        Ok(())
    }
}
