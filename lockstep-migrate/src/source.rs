//! Finding the step for an ordinal

use async_trait::async_trait;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{MigrationError, MigrationResult};
use crate::step::{ProcedureRegistry, Step};

/// Extension of declarative step files
pub const DECLARATIVE_EXTENSION: &str = "sql";

/// Resolves at most one step per ordinal
#[async_trait]
pub trait StepSource: Send + Sync {
    /// The step for `ordinal`, or `None` when the sequence ends there.
    ///
    /// `None` is a normal result; errors mean the candidates could not be
    /// inspected at all.
    async fn resolve(&self, ordinal: u64) -> MigrationResult<Option<Step>>;
}

/// Registered procedures backed by a directory of `{n}.sql` files.
///
/// A procedure registered for `n` shadows `n.sql`.
#[derive(Debug, Clone)]
pub struct DirectoryStepSource {
    directory: PathBuf,
    procedures: ProcedureRegistry,
}

impl DirectoryStepSource {
    pub fn new(directory: impl Into<PathBuf>, procedures: ProcedureRegistry) -> Self {
        Self {
            directory: directory.into(),
            procedures,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn procedures(&self) -> &ProcedureRegistry {
        &self.procedures
    }

    /// File name a declarative step for `ordinal` must have
    pub fn declarative_file_name(ordinal: u64) -> String {
        format!("{}.{}", ordinal, DECLARATIVE_EXTENSION)
    }

    /// Names of the regular files in the step directory
    async fn list_files(&self, ordinal: u64) -> MigrationResult<HashSet<OsString>> {
        let resolution_error = |e: std::io::Error| MigrationError::StepResolution {
            ordinal,
            message: format!("cannot list {}: {}", self.directory.display(), e),
        };

        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(resolution_error)?;

        let mut files = HashSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(resolution_error)? {
            let file_type = entry.file_type().await.map_err(resolution_error)?;
            let is_file = if file_type.is_symlink() {
                tokio::fs::metadata(entry.path())
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false)
            } else {
                file_type.is_file()
            };

            if is_file {
                files.insert(entry.file_name());
            }
        }

        trace!(
            directory = %self.directory.display(),
            files = files.len(),
            "Listed step directory"
        );
        Ok(files)
    }
}

#[async_trait]
impl StepSource for DirectoryStepSource {
    async fn resolve(&self, ordinal: u64) -> MigrationResult<Option<Step>> {
        let files = self.list_files(ordinal).await?;

        if let Some(procedure) = self.procedures.get(ordinal) {
            let file_name = Self::declarative_file_name(ordinal);
            if files.contains(&OsString::from(&file_name)) {
                debug!(
                    ordinal,
                    shadowed = %file_name,
                    "Procedure takes precedence over declarative step"
                );
            }
            return Ok(Some(Step::Procedural { ordinal, procedure }));
        }

        let file_name = Self::declarative_file_name(ordinal);
        if !files.contains(&OsString::from(&file_name)) {
            return Ok(None);
        }

        let path = self.directory.join(&file_name);
        let sql = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MigrationError::StepResolution {
                ordinal,
                message: format!("cannot read {}: {}", path.display(), e),
            })?;

        Ok(Some(Step::Declarative { ordinal, path, sql }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{ProceduralStep, StepContext, StepKind};
    use tempfile::TempDir;

    struct Noop;

    #[async_trait]
    impl ProceduralStep for Noop {
        async fn apply(&self, _ctx: &StepContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resolves_declarative_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("1.sql"), "CREATE TABLE t (id INTEGER)").unwrap();
        let source = DirectoryStepSource::new(dir.path(), ProcedureRegistry::new());

        let step = source.resolve(1).await.unwrap().unwrap();
        match step {
            Step::Declarative { ordinal, path, sql } => {
                assert_eq!(ordinal, 1);
                assert_eq!(path, dir.path().join("1.sql"));
                assert_eq!(sql, "CREATE TABLE t (id INTEGER)");
            }
            other => panic!("expected declarative step, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_procedure_shadows_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("1.sql"), "SELECT 1").unwrap();
        let mut procedures = ProcedureRegistry::new();
        procedures.register(1, Noop).unwrap();
        let source = DirectoryStepSource::new(dir.path(), procedures);

        let step = source.resolve(1).await.unwrap().unwrap();
        assert_eq!(step.kind(), StepKind::Procedural);
    }

    #[tokio::test]
    async fn test_missing_ordinal_ends_sequence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("1.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("3.sql"), "SELECT 3").unwrap();
        let source = DirectoryStepSource::new(dir.path(), ProcedureRegistry::new());

        assert!(source.resolve(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ignores_unrelated_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("01.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("1.sql.bak"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("1.txt"), "SELECT 1").unwrap();
        std::fs::create_dir(dir.path().join("2.sql")).unwrap();
        let source = DirectoryStepSource::new(dir.path(), ProcedureRegistry::new());

        assert!(source.resolve(1).await.unwrap().is_none());
        assert!(source.resolve(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let mut procedures = ProcedureRegistry::new();
        procedures.register(1, Noop).unwrap();
        let source = DirectoryStepSource::new(&missing, procedures);

        let err = source.resolve(1).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::StepResolution { ordinal: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_procedure_only_ordinals() {
        let dir = TempDir::new().unwrap();
        let mut procedures = ProcedureRegistry::new();
        procedures.register(1, Noop).unwrap();
        let source = DirectoryStepSource::new(dir.path(), procedures);

        assert_eq!(
            source.resolve(1).await.unwrap().map(|s| s.kind()),
            Some(StepKind::Procedural)
        );
        assert!(source.resolve(2).await.unwrap().is_none());
    }
}
