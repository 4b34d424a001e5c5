//! The version tracking table
//!
//! One table per migration target, holding exactly one row:
//!
//! | column    | type    | meaning                                   |
//! |-----------|---------|-------------------------------------------|
//! | `id`      | INTEGER | always [`TrackingTable::RECORD_ID`]        |
//! | `version` | BIGINT  | last successfully applied ordinal, 0 = none |
//! | `running` | INTEGER | 1 while a runner holds the execution lock   |

use lockstep_config::validation::is_valid_identifier;
use sea_orm::{ConnectionTrait, Statement};
use tracing::debug;

use crate::error::{is_already_exists, StorageError, StorageResult};

/// Snapshot of the tracking row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRecord {
    /// Last successfully applied ordinal
    pub version: u64,

    /// Whether a runner currently holds the execution lock
    pub running: bool,
}

/// Handle on the tracking table of one migration target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingTable {
    name: String,
}

impl TrackingTable {
    /// Primary key of the only row
    pub const RECORD_ID: i64 = 1;

    /// Bind to a table name, rejecting anything that is not a plain identifier
    pub fn new(name: impl Into<String>) -> StorageResult<Self> {
        let name = name.into();
        if !is_valid_identifier(&name) {
            return Err(StorageError::InvalidTableName(name));
        }
        Ok(Self { name })
    }

    /// Table name, unquoted
    pub fn name(&self) -> &str {
        &self.name
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.name)
    }

    /// Create the table and its row if either is missing.
    ///
    /// Safe to race: a concurrent creator winning is not an error.
    pub async fn ensure_exists<C: ConnectionTrait>(&self, db: &C) -> StorageResult<()> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id INTEGER PRIMARY KEY, \
                version BIGINT NOT NULL DEFAULT 0, \
                running INTEGER NOT NULL DEFAULT 0\
            )",
            self.quoted()
        );

        match db.execute(self.statement(db, create)).await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {
                debug!(table = %self.name, "Tracking table created concurrently");
            }
            Err(e) => return Err(StorageError::from_db("create tracking table", e)),
        }

        let insert = format!(
            "INSERT INTO {} (id, version, running) VALUES ({}, 0, 0) ON CONFLICT (id) DO NOTHING",
            self.quoted(),
            Self::RECORD_ID
        );
        let result = db
            .execute(self.statement(db, insert))
            .await
            .map_err(|e| StorageError::from_db("insert tracking record", e))?;

        if result.rows_affected() == 1 {
            debug!(table = %self.name, "Inserted initial tracking record");
        }

        Ok(())
    }

    /// Read the tracking row
    pub async fn read_record<C: ConnectionTrait>(&self, db: &C) -> StorageResult<VersionRecord> {
        let select = format!(
            "SELECT version, running FROM {} WHERE id = {}",
            self.quoted(),
            Self::RECORD_ID
        );

        let row = db
            .query_one(self.statement(db, select))
            .await
            .map_err(|e| StorageError::from_db("read tracking record", e))?
            .ok_or_else(|| StorageError::MissingRecord(self.name.clone()))?;

        let version: i64 = row
            .try_get("", "version")
            .map_err(|e| StorageError::from_db("decode version", e))?;
        let running: i32 = row
            .try_get("", "running")
            .map_err(|e| StorageError::from_db("decode running flag", e))?;

        let version = u64::try_from(version).map_err(|_| {
            StorageError::QueryFailed(format!(
                "tracking table '{}' holds negative version {}",
                self.name, version
            ))
        })?;

        Ok(VersionRecord {
            version,
            running: running != 0,
        })
    }

    /// Read the last applied version
    pub async fn read_version<C: ConnectionTrait>(&self, db: &C) -> StorageResult<u64> {
        Ok(self.read_record(db).await?.version)
    }

    /// Record `version` as applied.
    ///
    /// Only moves forward by one: the stored version must be `version - 1`.
    /// The update is a single autocommitted statement, durable on return.
    pub async fn advance_version<C: ConnectionTrait>(
        &self,
        db: &C,
        version: u64,
    ) -> StorageResult<()> {
        let previous = version.checked_sub(1).ok_or_else(|| {
            StorageError::VersionConflict("cannot advance to version 0".to_string())
        })?;

        let update = format!(
            "UPDATE {} SET version = {} WHERE id = {} AND version = {}",
            self.quoted(),
            version,
            Self::RECORD_ID,
            previous
        );
        let result = db
            .execute(self.statement(db, update))
            .await
            .map_err(|e| StorageError::from_db("advance version", e))?;

        if result.rows_affected() != 1 {
            let found = self.read_version(db).await?;
            return Err(StorageError::VersionConflict(format!(
                "expected '{}' at version {} before recording {}, found {}",
                self.name, previous, version, found
            )));
        }

        debug!(table = %self.name, version, "Advanced tracking version");
        Ok(())
    }

    /// Set `running` if it is clear. Returns whether this call set it.
    ///
    /// A single conditional update, so the check and the set cannot be
    /// interleaved by another session.
    pub async fn claim_running<C: ConnectionTrait>(&self, db: &C) -> StorageResult<bool> {
        let update = format!(
            "UPDATE {} SET running = 1 WHERE id = {} AND running = 0",
            self.quoted(),
            Self::RECORD_ID
        );
        let result = db
            .execute(self.statement(db, update))
            .await
            .map_err(|e| StorageError::from_db("claim running flag", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Clear `running`. Returns whether it was set.
    pub async fn clear_running<C: ConnectionTrait>(&self, db: &C) -> StorageResult<bool> {
        let update = format!(
            "UPDATE {} SET running = 0 WHERE id = {} AND running <> 0",
            self.quoted(),
            Self::RECORD_ID
        );
        let result = db
            .execute(self.statement(db, update))
            .await
            .map_err(|e| StorageError::from_db("clear running flag", e))?;

        Ok(result.rows_affected() == 1)
    }

    fn statement<C: ConnectionTrait>(&self, db: &C, sql: String) -> Statement {
        Statement::from_string(db.get_database_backend(), sql)
    }
}
