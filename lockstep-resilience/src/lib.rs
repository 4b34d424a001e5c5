//! Resilience patterns for lockstep
//!
//! This crate provides the backoff strategies and the retry loop used while
//! waiting for another runner to release a migration lock.

pub mod backoff;
pub mod retry;

// Re-export commonly used types
pub use backoff::{BackoffCalculator, BackoffStrategy};
pub use retry::{Contention, RetryExecutor, RetryPolicy};
