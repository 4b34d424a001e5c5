//! Storage error types

use lockstep_resilience::Contention;
use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection-related errors
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution errors
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// The resource is held by another runner, or the database reported it busy
    #[error("Contention: {0}")]
    Contention(String),

    /// The tracking table exists but its single row does not
    #[error("Tracking record missing from table '{0}'")]
    MissingRecord(String),

    /// The stored version is not the one the caller expected to advance from
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// Table name that cannot be used as a SQL identifier
    #[error("Invalid tracking table name: '{0}'")]
    InvalidTableName(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Classify a database error raised while doing `context`
    pub fn from_db(context: &str, err: DbErr) -> Self {
        let message = format!("{}: {}", context, err);

        if is_busy(&err) {
            return StorageError::Contention(message);
        }

        match err {
            DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => StorageError::ConnectionFailed(message),
            _ => StorageError::QueryFailed(message),
        }
    }

    /// Check if this error is contention rather than a failure
    pub fn is_contention(&self) -> bool {
        matches!(self, StorageError::Contention(_))
    }

    /// Get error code for reports and exit statuses
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::ConnectionFailed(_) => "CONNECTION_ERROR",
            StorageError::QueryFailed(_) => "QUERY_ERROR",
            StorageError::Contention(_) => "CONTENTION",
            StorageError::MissingRecord(_) => "MISSING_RECORD",
            StorageError::VersionConflict(_) => "VERSION_CONFLICT",
            StorageError::InvalidTableName(_) => "INVALID_TABLE_NAME",
            StorageError::ConfigError(_) => "CONFIG_ERROR",
            StorageError::Io(_) => "IO_ERROR",
        }
    }
}

impl Contention for StorageError {
    fn is_contention(&self) -> bool {
        StorageError::is_contention(self)
    }
}

/// Whether the database refused the statement because another session holds
/// a conflicting lock.
pub(crate) fn is_busy(err: &DbErr) -> bool {
    let runtime = match err {
        DbErr::Conn(e) | DbErr::Exec(e) | DbErr::Query(e) => e,
        _ => return false,
    };

    match runtime {
        RuntimeErr::SqlxError(sqlx_err) => match sqlx_err.as_database_error() {
            Some(db_err) => match db_err.code() {
                Some(code) => is_busy_code(&code),
                None => mentions_busy(db_err.message()),
            },
            None => false,
        },
        other => mentions_busy(&other.to_string()),
    }
}

/// Whether creating a table failed only because it is already there, or a
/// concurrent session was creating it at the same moment
pub(crate) fn is_already_exists(err: &DbErr) -> bool {
    match database_code(err) {
        Some(code) if is_already_exists_code(&code) => true,
        _ => err.to_string().contains("already exists"),
    }
}

/// SQLSTATE or SQLite result code the database attached to `err`
fn database_code(err: &DbErr) -> Option<String> {
    match err {
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e)) => e
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_already_exists_code(code: &str) -> bool {
    // PostgreSQL: duplicate_table, and the unique_violation on pg_type raised
    // when two sessions race CREATE TABLE IF NOT EXISTS
    matches!(code, "42P07" | "23505")
}

fn is_busy_code(code: &str) -> bool {
    // PostgreSQL: lock_not_available, deadlock_detected, serialization_failure
    if matches!(code, "55P03" | "40P01" | "40001") {
        return true;
    }

    // SQLite reports extended codes; the low byte is the primary code
    match code.parse::<i32>() {
        Ok(sqlite_code) => matches!(sqlite_code & 0xff, SQLITE_BUSY | SQLITE_LOCKED),
        Err(_) => false,
    }
}

fn mentions_busy(message: &str) -> bool {
    message.contains("database is locked") || message.contains("database table is locked")
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
