//! Domain-driven configuration for lockstep
//!
//! Configuration is split by functional domain (database, migrations,
//! logging), loaded from YAML with `LOCKSTEP_*` environment overrides and
//! validated before use.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

// Re-export domain configurations
pub use domains::{
    database::DatabaseConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    migrations::{MigrationsConfig, DEFAULT_STEP_DIRECTORY, DEFAULT_TRACKING_TABLE},
    LockstepConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration;
