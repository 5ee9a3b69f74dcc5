use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
pool:
  linger_secs: 45

factory:
  initial_retries: 6
  initial_grace_ms: 2500
  subsequent_retries: 2
  subsequent_grace_ms: 250

dial:
  connect_timeout_ms: 1500
  keepalive: false
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = handlepool::config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.pool.linger_secs, 45);
    assert_eq!(config.factory.initial_retries, 6);
    assert_eq!(config.factory.initial_grace_ms, 2500);
    assert_eq!(config.factory.subsequent_retries, 2);
    assert_eq!(config.factory.subsequent_grace_ms, 250);
    assert_eq!(config.dial.connect_timeout_ms, 1500);
    assert!(!config.dial.keepalive);

    let pool = config.pool_config();
    assert_eq!(pool.linger, Duration::from_secs(45));

    let dialer = config.dialer_config();
    assert_eq!(dialer.connect_timeout, Duration::from_millis(1500));
    assert!(!dialer.keepalive);
}

/// Test loading configuration from environment variables
#[test]
fn test_load_env_config() {
    let vars = [
        ("HANDLEPOOL_LINGER_SECS", "20"),
        ("HANDLEPOOL_INITIAL_RETRIES", "1"),
        ("HANDLEPOOL_INITIAL_GRACE_MS", "100"),
        ("HANDLEPOOL_SUBSEQUENT_RETRIES", "not-a-number"),
        ("HANDLEPOOL_KEEPALIVE", "false"),
    ];

    // Save original env vars
    let originals: Vec<_> = vars.iter().map(|(key, _)| (*key, env::var(key).ok())).collect();

    for (key, val) in vars {
        env::set_var(key, val);
    }

    let config = handlepool::config::load_from_env().unwrap();

    assert_eq!(config.pool.linger_secs, 20);
    assert_eq!(config.factory.initial_retries, 1);
    assert_eq!(config.factory.initial_grace_ms, 100);
    // Unparsable values keep the default
    assert_eq!(config.factory.subsequent_retries, 3);
    assert_eq!(config.factory.subsequent_grace_ms, 500);
    assert!(!config.dial.keepalive);

    // Restore original env vars
    for (key, orig) in originals {
        cleanup_env(key, orig);
    }
}

/// Test default values
#[test]
fn test_default_values() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, "pool: {}\n").unwrap();

    let config = handlepool::config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.pool.linger_secs, 10);
    assert_eq!(config.factory.initial_retries, 4);
    assert_eq!(config.factory.initial_grace_ms, 5000);
    assert_eq!(config.factory.subsequent_retries, 3);
    assert_eq!(config.factory.subsequent_grace_ms, 500);
    assert_eq!(config.dial.connect_timeout_ms, 3000);
    assert!(config.dial.keepalive);
}

/// Test that invalid files are rejected
#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();

    let zero_linger = temp_dir.path().join("zero.yaml");
    fs::write(&zero_linger, "pool:\n  linger_secs: 0\n").unwrap();
    assert!(handlepool::config::load_from_yaml(&zero_linger).is_err());

    let malformed = temp_dir.path().join("bad.yaml");
    fs::write(&malformed, "factory:\n  initial_retries: [1, 2\n").unwrap();
    assert!(handlepool::config::load_from_yaml(&malformed).is_err());

    let missing = temp_dir.path().join("missing.yaml");
    let err = handlepool::config::load_config(missing.to_str()).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

/// Helper function to cleanup environment variables
fn cleanup_env(key: &str, orig_val: Option<String>) {
    match orig_val {
        Some(val) => env::set_var(key, val),
        None => env::remove_var(key),
    }
}
