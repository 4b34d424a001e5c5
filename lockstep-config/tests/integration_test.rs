//! Integration tests for lockstep-config

use lockstep_config::*;
use lockstep_resilience::BackoffStrategy;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = LockstepConfig::default();
    assert!(config.validate_all().is_ok());
    assert_eq!(config.migrations.tracking_table, DEFAULT_TRACKING_TABLE);
    assert_eq!(
        config.migrations.step_directory,
        PathBuf::from(DEFAULT_STEP_DIRECTORY)
    );
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("LOCKSTEP_DATABASE_URL", Some("sqlite:///tmp/app.db?mode=rwc")),
        ("LOCKSTEP_TRACKING_TABLE", Some("schema_version")),
        ("LOCKSTEP_STEP_DIRECTORY", Some("/srv/app/migrations")),
        ("LOCKSTEP_LOCK_RETRY_MS", Some("2500")),
        ("LOCKSTEP_LOG_LEVEL", Some("debug")),
    ];

    with_vars(vars, || {
        let config = ConfigLoader::new().from_env().unwrap();

        assert_eq!(config.database.url, "sqlite:///tmp/app.db?mode=rwc");
        assert_eq!(config.migrations.tracking_table, "schema_version");
        assert_eq!(
            config.migrations.step_directory,
            PathBuf::from("/srv/app/migrations")
        );
        assert_eq!(
            config.migrations.lock_retry.initial_delay,
            Duration::from_millis(2500)
        );
        // max_delay is raised so the policy stays valid
        assert_eq!(
            config.migrations.lock_retry.max_delay,
            Duration::from_millis(2500)
        );
        assert_eq!(config.logging.level, LogLevel::Debug);
    });
}

#[test]
fn test_invalid_env_values_are_rejected() {
    with_vars(vec![("LOCKSTEP_LOCK_RETRY_MS", Some("soon"))], || {
        let result = ConfigLoader::new().from_env();
        assert!(matches!(result, Err(ConfigError::EnvError(_))));
    });

    with_vars(vec![("LOCKSTEP_TRACKING_TABLE", Some("drop table"))], || {
        let result = ConfigLoader::new().from_env();
        assert!(matches!(result, Err(ConfigError::DomainError { .. })));
    });
}

#[test]
fn test_custom_prefix() {
    with_vars(vec![("MYAPP_TRACKING_TABLE", Some("myapp_version"))], || {
        let config = ConfigLoader::with_prefix("MYAPP").from_env().unwrap();
        assert_eq!(config.migrations.tracking_table, "myapp_version");
    });
}

#[test]
fn test_yaml_config_serialization() {
    let yaml = LockstepConfig::generate_sample();
    let parsed: LockstepConfig = serde_yaml::from_str(&yaml).unwrap();
    assert!(parsed.validate_all().is_ok());
    assert_eq!(parsed.migrations.lock_retry.initial_delay, Duration::from_millis(100));
}

#[test]
fn test_comprehensive_config_file() {
    let yaml = r#"
database:
  url: "sqlite://./data/app.db?mode=rwc"
  max_connections: 3
  connection_timeout: 10

migrations:
  tracking_table: app_version
  step_directory: ./sql
  lock_retry:
    initial_delay: 50ms
    max_delay: 800ms
    backoff_strategy:
      type: exponential
      base: 2.0
    jitter: true

logging:
  level: warn
  format: json
  directives:
    - "sqlx=error"
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let config = temp_env::with_vars_unset(
        vec!["LOCKSTEP_TRACKING_TABLE", "LOCKSTEP_LOG_LEVEL"],
        || ConfigLoader::new().from_file(file.path()).unwrap(),
    );

    assert_eq!(config.database.max_connections, 3);
    assert_eq!(config.database.connection_timeout, Duration::from_secs(10));
    assert_eq!(config.migrations.tracking_table, "app_version");
    assert_eq!(config.migrations.step_directory, PathBuf::from("./sql"));
    assert_eq!(
        config.migrations.lock_retry.backoff_strategy,
        BackoffStrategy::Exponential { base: 2.0 }
    );
    assert!(config.migrations.lock_retry.jitter);
    assert_eq!(config.logging.level, LogLevel::Warn);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.logging.filter_directives(), "warn,sqlx=error");
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = ConfigLoader::new().from_file("/definitely/not/here.yaml");
    assert!(matches!(result, Err(ConfigError::FileReadError(_))));
}
