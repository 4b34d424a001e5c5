//! Structured logging setup for lockstep
//!
//! Library crates only emit `tracing` events; binaries call
//! [`init_logging_from_config`] once to decide where those events go. Without
//! a subscriber every event is discarded.

pub mod init;

pub use init::{build_env_filter, init_logging_from_config};
pub use lockstep_config::{LogFormat, LogLevel, LoggingConfig};
