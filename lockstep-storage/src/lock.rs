//! Cross-process execution lock
//!
//! At most one runner per tracking table may be between acquire and release.
//! [`FlagLock`] keeps the lock in the `running` column of the tracking row,
//! so any process that can reach the database observes it. Contention is
//! retried without limit through [`RetryExecutor`]; everything else fails
//! the acquisition immediately.

use async_trait::async_trait;
use lockstep_resilience::{RetryExecutor, RetryPolicy};
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::tracking::TrackingTable;

/// Proof that the caller holds the lock on one tracking table
#[derive(Debug)]
#[must_use = "a held lock must be released"]
pub struct LockToken {
    table: String,
    acquired_at: Instant,
    attempts: u32,
}

impl LockToken {
    /// Tracking table this token locks
    pub fn table(&self) -> &str {
        &self.table
    }

    /// How many attempts the acquisition took
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time since the lock was acquired
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Mutual exclusion between migration runners
#[async_trait]
pub trait ExecutionLock: Send + Sync {
    /// Block until the lock is held. Only non-contention failures return early.
    async fn acquire(&self, db: &DatabaseConnection) -> StorageResult<LockToken>;

    /// Give the lock up
    async fn release(&self, db: &DatabaseConnection, token: LockToken) -> StorageResult<()>;
}

/// Lock held in the `running` flag of the tracking row
#[derive(Debug, Clone)]
pub struct FlagLock {
    table: TrackingTable,
    retry: RetryExecutor,
}

impl FlagLock {
    /// Create a lock on `table`, polling at the pace of `policy` while contended
    pub fn new(table: TrackingTable, policy: RetryPolicy) -> Self {
        Self {
            table,
            retry: RetryExecutor::new(policy),
        }
    }

    /// The table whose row carries the flag
    pub fn table(&self) -> &TrackingTable {
        &self.table
    }

    /// Make a single attempt. Returns [`StorageError::Contention`] when the
    /// flag is already set.
    pub async fn try_acquire(&self, db: &DatabaseConnection) -> StorageResult<()> {
        let txn = db
            .begin()
            .await
            .map_err(|e| StorageError::from_db("begin lock transaction", e))?;

        let claimed = self.table.claim_running(&txn).await?;
        txn.commit()
            .await
            .map_err(|e| StorageError::from_db("commit lock transaction", e))?;

        if claimed {
            Ok(())
        } else {
            Err(StorageError::Contention(format!(
                "'{}' is locked by another runner",
                self.table.name()
            )))
        }
    }

    /// Clear the flag without holding a token.
    ///
    /// Recovery after a runner died while holding the lock. Returns whether
    /// the flag was set.
    pub async fn force_release(&self, db: &DatabaseConnection) -> StorageResult<bool> {
        let was_set = self.table.clear_running(db).await?;
        if was_set {
            warn!(table = %self.table.name(), "Forcibly cleared execution lock");
        } else {
            info!(table = %self.table.name(), "Execution lock was not held");
        }
        Ok(was_set)
    }
}

#[async_trait]
impl ExecutionLock for FlagLock {
    async fn acquire(&self, db: &DatabaseConnection) -> StorageResult<LockToken> {
        debug!(table = %self.table.name(), "Acquiring execution lock");

        let mut attempts = 0;
        {
            let attempts = &mut attempts;
            self.retry
                .execute(move |attempt| {
                    *attempts = attempt;
                    self.try_acquire(db)
                })
                .await?;
        }

        info!(
            table = %self.table.name(),
            attempts,
            "Execution lock acquired"
        );

        Ok(LockToken {
            table: self.table.name().to_string(),
            acquired_at: Instant::now(),
            attempts,
        })
    }

    async fn release(&self, db: &DatabaseConnection, token: LockToken) -> StorageResult<()> {
        if token.table != self.table.name() {
            return Err(StorageError::ConfigError(format!(
                "token for '{}' cannot release '{}'",
                token.table,
                self.table.name()
            )));
        }

        let was_set = self.table.clear_running(db).await?;
        if was_set {
            info!(
                table = %token.table,
                held_ms = token.held_for().as_millis() as u64,
                "Execution lock released"
            );
        } else {
            warn!(
                table = %token.table,
                "Execution lock was already clear at release"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDatabase;
    use std::sync::Arc;

    fn lock_on(name: &str) -> FlagLock {
        FlagLock::new(
            TrackingTable::new(name).unwrap(),
            RetryPolicy::fixed(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let db = TestDatabase::new().await.unwrap();
        let lock = lock_on("db_version");
        lock.table().ensure_exists(&db.connection).await.unwrap();

        let token = lock.acquire(&db.connection).await.unwrap();
        assert_eq!(token.table(), "db_version");
        assert_eq!(token.attempts(), 1);
        assert!(lock.table().read_record(&db.connection).await.unwrap().running);

        lock.release(&db.connection, token).await.unwrap();
        assert!(!lock.table().read_record(&db.connection).await.unwrap().running);
    }

    #[tokio::test]
    async fn test_try_acquire_reports_contention() {
        let db = TestDatabase::new().await.unwrap();
        let lock = lock_on("db_version");
        lock.table().ensure_exists(&db.connection).await.unwrap();

        lock.try_acquire(&db.connection).await.unwrap();
        let err = lock.try_acquire(&db.connection).await.unwrap_err();
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn test_missing_table_fails_without_retrying() {
        let db = TestDatabase::new().await.unwrap();
        let lock = lock_on("db_version");

        let err = tokio::time::timeout(Duration::from_secs(5), lock.acquire(&db.connection))
            .await
            .expect("acquire must not spin on a missing table")
            .unwrap_err();
        assert!(!err.is_contention());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_acquire_waits_for_holder() {
        let db = TestDatabase::new().await.unwrap();
        let other = db.connect_another().await.unwrap();
        let lock = Arc::new(lock_on("db_version"));
        lock.table().ensure_exists(&db.connection).await.unwrap();

        let first = lock.acquire(&db.connection).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let token = lock.acquire(&other).await.unwrap();
                let attempts = token.attempts();
                lock.release(&other, token).await.unwrap();
                attempts
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        lock.release(&db.connection, first).await.unwrap();
        let attempts = waiter.await.unwrap();
        assert!(attempts > 1);
    }

    #[tokio::test]
    async fn test_force_release() {
        let db = TestDatabase::new().await.unwrap();
        let lock = lock_on("db_version");
        lock.table().ensure_exists(&db.connection).await.unwrap();

        assert!(!lock.force_release(&db.connection).await.unwrap());

        let token = lock.acquire(&db.connection).await.unwrap();
        assert!(lock.force_release(&db.connection).await.unwrap());

        // The orphaned token's release still succeeds
        lock.release(&db.connection, token).await.unwrap();
    }

    #[tokio::test]
    async fn test_token_cannot_release_other_table() {
        let db = TestDatabase::new().await.unwrap();
        let first = lock_on("first_version");
        let second = lock_on("second_version");
        first.table().ensure_exists(&db.connection).await.unwrap();
        second.table().ensure_exists(&db.connection).await.unwrap();

        let token = first.acquire(&db.connection).await.unwrap();
        let err = second.release(&db.connection, token).await.unwrap_err();
        assert!(matches!(err, StorageError::ConfigError(_)));
    }
}
