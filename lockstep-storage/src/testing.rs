//! Database testing utilities for lockstep-storage
//!
//! Every [`TestDatabase`] is a SQLite file in its own temporary directory, so
//! several pools can open it at once and behave like independent processes.

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use std::path::Path;
use tempfile::TempDir;

/// Test database for isolated testing
pub struct TestDatabase {
    temp_dir: TempDir,
    url: String,
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    /// Create a new file-backed SQLite test database
    pub async fn new() -> Result<Self, TestDatabaseError> {
        let temp_dir =
            TempDir::new().map_err(|e| TestDatabaseError::TempDirCreation(e.to_string()))?;

        let db_path = temp_dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let connection = Database::connect(&url)
            .await
            .map_err(|e| TestDatabaseError::Connection(e.to_string()))?;

        Ok(Self {
            temp_dir,
            url,
            connection,
        })
    }

    /// Connection URL of the database file
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Scratch directory next to the database file, removed on drop
    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Open a second, independent pool on the same database
    pub async fn connect_another(&self) -> Result<DatabaseConnection, TestDatabaseError> {
        Database::connect(&self.url)
            .await
            .map_err(|e| TestDatabaseError::Connection(e.to_string()))
    }

    /// Get a count of rows in a table
    pub async fn count_rows(&self, table: &str) -> Result<u64, TestDatabaseError> {
        let count = self
            .query_i64(&format!("SELECT COUNT(*) AS value FROM \"{}\"", table))
            .await?;
        Ok(count.unwrap_or(0) as u64)
    }

    /// Whether a table with this name exists
    pub async fn table_exists(&self, table: &str) -> Result<bool, TestDatabaseError> {
        let count = self
            .query_i64(&format!(
                "SELECT COUNT(*) AS value FROM sqlite_master WHERE type = 'table' AND name = '{}'",
                table.replace('\'', "''")
            ))
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    /// Run a query whose first row has an integer column named `value`
    pub async fn query_i64(&self, sql: &str) -> Result<Option<i64>, TestDatabaseError> {
        let row = self
            .connection
            .query_one(Statement::from_string(
                self.connection.get_database_backend(),
                sql.to_string(),
            ))
            .await
            .map_err(|e| TestDatabaseError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let value: i64 = row
                    .try_get("", "value")
                    .map_err(|e| TestDatabaseError::Query(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Execute a statement outside any migration
    pub async fn execute(&self, sql: &str) -> Result<(), TestDatabaseError> {
        self.connection
            .execute_unprepared(sql)
            .await
            .map_err(|e| TestDatabaseError::Query(e.to_string()))?;
        Ok(())
    }
}

/// Test database errors
#[derive(Debug, thiserror::Error)]
pub enum TestDatabaseError {
    #[error("Failed to create temporary directory: {0}")]
    TempDirCreation(String),

    #[error("Database connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),
}
