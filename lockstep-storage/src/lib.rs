//! Version tracking and execution locking for lockstep
//!
//! This crate owns everything lockstep persists: the single-row tracking
//! table that records the applied version, and the `running` flag in that row
//! which serves as the cross-process execution lock.

pub mod connection;
pub mod error;
pub mod lock;
pub mod tracking;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export core types for convenience
pub use connection::connect;
pub use error::{StorageError, StorageResult};
pub use lock::{ExecutionLock, FlagLock, LockToken};
pub use tracking::{TrackingTable, VersionRecord};

// Callers hand us their own connection
pub use sea_orm::DatabaseConnection;
