//! Configuration management for Windowguard.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WindowguardError};
use crate::ratelimit::{FailurePolicy, MIN_INTERVAL};

/// Prefix for environment overrides, e.g. `WINDOWGUARD__LIMITER__LIMIT=50`.
pub const ENV_PREFIX: &str = "WINDOWGUARD";

/// Main configuration for a Windowguard process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowguardConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Namespace of the limiter's keys in the store
    #[serde(default = "default_base_key")]
    pub base_key: String,

    /// Events allowed per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Flush task period in seconds
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Answer given when the store cannot be consulted
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Compare-and-swap attempts per increment
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            base_key: default_base_key(),
            limit: default_limit(),
            interval_secs: default_interval_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            failure_policy: FailurePolicy::default(),
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

impl LimiterSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Reject settings the limiter would refuse at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.base_key.trim().is_empty() {
            return Err(WindowguardError::Config("base_key must not be empty".to_string()));
        }
        if self.interval() < MIN_INTERVAL {
            return Err(WindowguardError::Config(format!(
                "interval_secs must be at least {}, got {}",
                MIN_INTERVAL.as_secs(),
                self.interval_secs
            )));
        }
        if self.flush_interval_secs == 0 {
            return Err(WindowguardError::Config(
                "flush_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_base_key() -> String {
    "windowguard".to_string()
}

fn default_limit() -> u64 {
    100
}

fn default_interval_secs() -> u64 {
    60
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_max_cas_retries() -> u32 {
    crate::ratelimit::DEFAULT_MAX_CAS_RETRIES
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WindowguardConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `WINDOWGUARD__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: WindowguardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WindowguardError::Config(e.to_string()))?;
        config.limiter.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WindowguardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WindowguardError::Config(format!("Failed to parse config: {}", e)))?;
        config.limiter.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment overrides are process-wide; tests calling `load` take this.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn temp_config(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("windowguard-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = WindowguardConfig::default();
        assert_eq!(config.limiter.base_key, "windowguard");
        assert_eq!(config.limiter.limit, 100);
        assert_eq!(config.limiter.interval(), Duration::from_secs(60));
        assert_eq!(config.limiter.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.logging.level, "info");
        assert!(config.limiter.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
limiter:
  base_key: checkout
  limit: 5
  interval_secs: 120
  failure_policy: open
"#;
        let config = WindowguardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.base_key, "checkout");
        assert_eq!(config.limiter.limit, 5);
        assert_eq!(config.limiter.interval_secs, 120);
        assert_eq!(config.limiter.flush_interval_secs, 10);
        assert_eq!(config.limiter.failure_policy, FailurePolicy::Open);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_short_interval_rejected() {
        let yaml = r#"
limiter:
  interval_secs: 30
"#;
        assert!(matches!(
            WindowguardConfig::from_yaml(yaml),
            Err(WindowguardError::Config(_))
        ));
    }

    #[test]
    fn test_zero_flush_interval_rejected() {
        let settings = LimiterSettings {
            flush_interval_secs: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = WindowguardConfig::from_yaml("limiter: [").unwrap_err();
        assert!(matches!(err, WindowguardError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let _env = ENV_LOCK.lock();
        let path = temp_config("limiter:\n  base_key: fromfile\n  limit: 7\nlogging:\n  json: true\n");

        let config = WindowguardConfig::load(Some(&path)).unwrap();
        assert_eq!(config.limiter.base_key, "fromfile");
        assert_eq!(config.limiter.limit, 7);
        assert!(config.logging.json);

        let same = WindowguardConfig::from_file(&path).unwrap();
        assert_eq!(same, config);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_env_overrides_file() {
        let _env = ENV_LOCK.lock();
        let path = temp_config("limiter:\n  base_key: fromfile\n  limit: 7\n  failure_policy: closed\n");

        std::env::set_var("WINDOWGUARD__LIMITER__LIMIT", "42");
        std::env::set_var("WINDOWGUARD__LIMITER__FAILURE_POLICY", "open");
        let loaded = WindowguardConfig::load(Some(&path));
        std::env::remove_var("WINDOWGUARD__LIMITER__LIMIT");
        std::env::remove_var("WINDOWGUARD__LIMITER__FAILURE_POLICY");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.limiter.limit, 42);
        assert_eq!(config.limiter.failure_policy, FailurePolicy::Open);
        // Keys the environment does not mention still come from the file
        assert_eq!(config.limiter.base_key, "fromfile");
        assert_eq!(config.limiter.interval_secs, 60);
    }
}
