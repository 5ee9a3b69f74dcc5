use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::dial::TcpDialerConfig;
use crate::pool::{FactoryConfig, PoolConfig};

/// Pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Seconds an unreferenced connection may stay idle before eviction
    #[serde(default = "default_linger_secs")]
    pub linger_secs: u64,
}

fn default_linger_secs() -> u64 {
    10
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            linger_secs: default_linger_secs(),
        }
    }
}

/// Retry settings for the connection factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorySettings {
    /// Retries for an endpoint dialed for the first time
    #[serde(default = "default_initial_retries")]
    pub initial_retries: u32,

    /// Milliseconds between first-contact retries
    #[serde(default = "default_initial_grace_ms")]
    pub initial_grace_ms: u64,

    /// Retries for an endpoint dialed before
    #[serde(default = "default_subsequent_retries")]
    pub subsequent_retries: u32,

    /// Milliseconds between retries on a known endpoint
    #[serde(default = "default_subsequent_grace_ms")]
    pub subsequent_grace_ms: u64,
}

fn default_initial_retries() -> u32 {
    4
}

fn default_initial_grace_ms() -> u64 {
    5000
}

fn default_subsequent_retries() -> u32 {
    3
}

fn default_subsequent_grace_ms() -> u64 {
    500
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            initial_retries: default_initial_retries(),
            initial_grace_ms: default_initial_grace_ms(),
            subsequent_retries: default_subsequent_retries(),
            subsequent_grace_ms: default_subsequent_grace_ms(),
        }
    }
}

/// TCP dialer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialSettings {
    /// Timeout for one connect attempt in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Enable TCP keep-alive
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_keepalive() -> bool {
    true
}

impl Default for DialSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive: default_keepalive(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub factory: FactorySettings,

    #[serde(default)]
    pub dial: DialSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool.linger_secs == 0 {
            anyhow::bail!("pool.linger_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from(&self.pool)
    }

    pub fn factory_config(&self) -> FactoryConfig {
        FactoryConfig::from(&self.factory)
    }

    pub fn dialer_config(&self) -> TcpDialerConfig {
        TcpDialerConfig::from(&self.dial)
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig::with_linger_secs(settings.linger_secs)
    }
}

impl From<&FactorySettings> for FactoryConfig {
    fn from(settings: &FactorySettings) -> Self {
        FactoryConfig {
            initial_retries: settings.initial_retries,
            initial_grace: Duration::from_millis(settings.initial_grace_ms),
            subsequent_retries: settings.subsequent_retries,
            subsequent_grace: Duration::from_millis(settings.subsequent_grace_ms),
        }
    }
}

impl From<&DialSettings> for TcpDialerConfig {
    fn from(settings: &DialSettings) -> Self {
        TcpDialerConfig {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            keepalive: settings.keepalive,
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Parse `name` into `target` if set and well-formed; otherwise leave the default
fn override_from_env<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(val) = raw.trim().parse() {
            *target = val;
        }
    }
}

/// Load configuration from environment variables
///
/// Every variable is optional; unset or unparsable values keep the default:
/// - HANDLEPOOL_LINGER_SECS
/// - HANDLEPOOL_INITIAL_RETRIES / HANDLEPOOL_INITIAL_GRACE_MS
/// - HANDLEPOOL_SUBSEQUENT_RETRIES / HANDLEPOOL_SUBSEQUENT_GRACE_MS
/// - HANDLEPOOL_CONNECT_TIMEOUT_MS
/// - HANDLEPOOL_KEEPALIVE (true/false)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    override_from_env("HANDLEPOOL_LINGER_SECS", &mut config.pool.linger_secs);
    override_from_env("HANDLEPOOL_INITIAL_RETRIES", &mut config.factory.initial_retries);
    override_from_env("HANDLEPOOL_INITIAL_GRACE_MS", &mut config.factory.initial_grace_ms);
    override_from_env("HANDLEPOOL_SUBSEQUENT_RETRIES", &mut config.factory.subsequent_retries);
    override_from_env("HANDLEPOOL_SUBSEQUENT_GRACE_MS", &mut config.factory.subsequent_grace_ms);
    override_from_env("HANDLEPOOL_CONNECT_TIMEOUT_MS", &mut config.dial.connect_timeout_ms);
    override_from_env("HANDLEPOOL_KEEPALIVE", &mut config.dial.keepalive);

    config.validate().context("Invalid configuration from environment")?;
    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
