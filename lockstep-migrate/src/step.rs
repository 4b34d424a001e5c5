//! Migration steps and the context procedural steps run in

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Span;

use crate::error::{MigrationError, MigrationResult};

/// A migration step written in Rust
///
/// ```ignore
/// struct RenameColumn;
///
/// #[async_trait]
/// impl ProceduralStep for RenameColumn {
///     async fn apply(&self, ctx: &StepContext<'_>) -> anyhow::Result<()> {
///         ctx.db
///             .execute_unprepared("ALTER TABLE bloj RENAME COLUMN nisse TO hasse")
///             .await?;
///         ctx.log.info("renamed nisse to hasse");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ProceduralStep: Send + Sync {
    /// Run the step. Any error aborts the run and leaves the version unchanged.
    async fn apply(&self, ctx: &StepContext<'_>) -> anyhow::Result<()>;

    /// Short human-readable summary, shown by `status`
    fn description(&self) -> Option<&str> {
        None
    }
}

/// What a procedural step gets to work with
pub struct StepContext<'a> {
    /// The connection the run is using
    pub db: &'a DatabaseConnection,

    /// Logger scoped to this step
    pub log: StepLog,

    /// Ordinal of the step being applied
    pub ordinal: u64,
}

impl<'a> StepContext<'a> {
    pub fn new(db: &'a DatabaseConnection, log: StepLog, ordinal: u64) -> Self {
        Self { db, log, ordinal }
    }
}

/// Logger handed to steps; every event lands inside the step's span
#[derive(Debug, Clone)]
pub struct StepLog {
    span: Span,
}

impl StepLog {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn trace(&self, message: impl fmt::Display) {
        self.span.in_scope(|| tracing::trace!("{}", message));
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.span.in_scope(|| tracing::debug!("{}", message));
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.span.in_scope(|| tracing::info!("{}", message));
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.span.in_scope(|| tracing::warn!("{}", message));
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.span.in_scope(|| tracing::error!("{}", message));
    }
}

/// The two forms a step can take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Procedural,
    Declarative,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Procedural => f.pad("procedural"),
            StepKind::Declarative => f.pad("declarative"),
        }
    }
}

/// One resolved migration step
#[derive(Clone)]
pub enum Step {
    /// Registered Rust code
    Procedural {
        ordinal: u64,
        procedure: Arc<dyn ProceduralStep>,
    },

    /// SQL read from `{ordinal}.sql`
    Declarative {
        ordinal: u64,
        path: PathBuf,
        sql: String,
    },
}

impl Step {
    pub fn ordinal(&self) -> u64 {
        match self {
            Step::Procedural { ordinal, .. } | Step::Declarative { ordinal, .. } => *ordinal,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Procedural { .. } => StepKind::Procedural,
            Step::Declarative { .. } => StepKind::Declarative,
        }
    }

    /// One-line description for logs and status output
    pub fn describe(&self) -> String {
        match self {
            Step::Procedural { procedure, .. } => procedure
                .description()
                .unwrap_or("procedural step")
                .to_string(),
            Step::Declarative { path, .. } => path.display().to_string(),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Procedural { ordinal, procedure } => f
                .debug_struct("Procedural")
                .field("ordinal", ordinal)
                .field("description", &procedure.description())
                .finish(),
            Step::Declarative { ordinal, path, sql } => f
                .debug_struct("Declarative")
                .field("ordinal", ordinal)
                .field("path", path)
                .field("bytes", &sql.len())
                .finish(),
        }
    }
}

/// Procedural steps keyed by ordinal
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    procedures: BTreeMap<u64, Arc<dyn ProceduralStep>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `procedure` as step `ordinal`. Ordinals start at 1 and each
    /// may be registered once.
    pub fn register<P>(&mut self, ordinal: u64, procedure: P) -> MigrationResult<()>
    where
        P: ProceduralStep + 'static,
    {
        self.register_arc(ordinal, Arc::new(procedure))
    }

    pub fn register_arc(
        &mut self,
        ordinal: u64,
        procedure: Arc<dyn ProceduralStep>,
    ) -> MigrationResult<()> {
        if ordinal == 0 {
            return Err(MigrationError::Registry(
                "ordinals start at 1; 0 means nothing applied".to_string(),
            ));
        }
        if self.procedures.contains_key(&ordinal) {
            return Err(MigrationError::Registry(format!(
                "a procedure is already registered for step {}",
                ordinal
            )));
        }

        self.procedures.insert(ordinal, procedure);
        Ok(())
    }

    pub fn get(&self, ordinal: u64) -> Option<Arc<dyn ProceduralStep>> {
        self.procedures.get(&ordinal).cloned()
    }

    pub fn contains(&self, ordinal: u64) -> bool {
        self.procedures.contains_key(&ordinal)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    /// Registered ordinals, ascending
    pub fn ordinals(&self) -> impl Iterator<Item = u64> + '_ {
        self.procedures.keys().copied()
    }
}

impl fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("ordinals", &self.procedures.keys().collect::<Vec<_>>())
            .finish()
    }
}
