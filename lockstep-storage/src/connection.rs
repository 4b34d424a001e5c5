//! Opening the database a migration run targets

use lockstep_config::DatabaseConfig;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};

/// Open a connection pool for the configured database.
///
/// The migrator itself only needs an already-connected handle; this is the
/// convenience used by the CLI and by tests.
pub async fn connect(config: &DatabaseConfig) -> StorageResult<DatabaseConnection> {
    info!("Connecting to database: {}", redact_url(&config.url));

    ensure_sqlite_parent_dir(&config.url)?;

    let mut opts = ConnectOptions::new(config.url.clone());
    opts.max_connections(config.max_connections)
        .min_connections(1)
        .connect_timeout(config.connection_timeout)
        .acquire_timeout(config.connection_timeout)
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let connection = Database::connect(opts)
        .await
        .map_err(|e| StorageError::from_db("connect", e))?;

    debug!(
        "Database connection established with {} max connections",
        config.max_connections
    );

    Ok(connection)
}

/// Create the directory of a file-backed SQLite database so `mode=rwc` can
/// create the file itself.
fn ensure_sqlite_parent_dir(database_url: &str) -> StorageResult<()> {
    let Some(file_path) = sqlite_file_path(database_url) else {
        return Ok(());
    };

    let path = Path::new(file_path);
    if let Some(parent_dir) = path.parent() {
        if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
            info!("Creating database directory: {:?}", parent_dir);
            std::fs::create_dir_all(parent_dir).map_err(|e| {
                StorageError::ConfigError(format!(
                    "Failed to create database directory {:?}: {}",
                    parent_dir, e
                ))
            })?;
        }
    }

    Ok(())
}

/// File path of a SQLite URL, or `None` for in-memory and non-SQLite URLs
fn sqlite_file_path(database_url: &str) -> Option<&str> {
    if database_url.contains(":memory:") {
        return None;
    }

    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;

    // Drop query parameters such as ?mode=rwc
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Hide the password of a URL before it is logged
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.find(':') {
                Some(colon) => format!(
                    "{}{}:***{}",
                    &url[..scheme_end + 3],
                    &credentials[..colon],
                    &url[at..]
                ),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}
