//! Ordered, exactly-once database migrations for lockstep
//!
//! A [`Migrator`] applies the steps after the recorded version of one
//! tracking table. Steps are either Rust code registered as a
//! [`ProceduralStep`] or a `{n}.sql` file in the step directory; when both
//! exist for `n`, the procedure wins. Concurrent runs against the same table,
//! in this process or any other, wait for each other and never apply a step
//! twice.
//!
//! ```ignore
//! let migrator = Migrator::builder(db)
//!     .step_directory("./dbmigration")
//!     .procedure(2, RenameColumn)
//!     .build()?;
//! let report = migrator.run().await?;
//! ```

pub mod error;
pub mod executor;
pub mod migrator;
pub mod source;
pub mod step;

pub use error::{MigrationError, MigrationResult};
pub use executor::StepExecutor;
pub use migrator::{
    AppliedStep, MigrationReport, MigrationStatus, Migrator, MigratorBuilder, PendingStep,
    RunState,
};
pub use source::{DirectoryStepSource, StepSource, DECLARATIVE_EXTENSION};
pub use step::{ProceduralStep, ProcedureRegistry, Step, StepContext, StepKind, StepLog};

// Commonly needed alongside the migrator
pub use async_trait::async_trait;
pub use lockstep_storage::{DatabaseConnection, VersionRecord};
