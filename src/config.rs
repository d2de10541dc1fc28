//! Configuration management for Ratewindow.
//!
//! Values come from an optional YAML file, overridden by environment
//! variables prefixed `RATEWINDOW__` (e.g. `RATEWINDOW__STORE__URL`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RateWindowError, Result};
use crate::ratelimit::{LimitRule, RuleSet, DEFAULT_KEY_NAMESPACE};
use crate::store::StoreOptions;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindowConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named limit rules
    #[serde(default)]
    pub limits: Vec<LimitRule>,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for every scope key
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,

    /// Initial connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-evaluation timeout in milliseconds
    #[serde(default = "default_evaluate_timeout")]
    pub evaluate_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_namespace: default_key_namespace(),
            connect_timeout_ms: default_connect_timeout(),
            evaluate_timeout_ms: default_evaluate_timeout(),
        }
    }
}

impl StoreConfig {
    /// Connection options for the Redis store.
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            url: self.url.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    /// Timeout applied to each evaluation.
    pub fn evaluate_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluate_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_namespace() -> String {
    DEFAULT_KEY_NAMESPACE.to_string()
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_evaluate_timeout() -> u64 {
    250
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
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

impl RateWindowConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RATEWINDOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RateWindowConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateWindowConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateWindowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            return Err(RateWindowError::Config("store.url must not be empty".to_string()));
        }
        if self.store.evaluate_timeout_ms == 0 {
            return Err(RateWindowError::Config(
                "store.evaluate_timeout_ms must be positive".to_string(),
            ));
        }
        self.rules().validate()
    }

    /// The configured limit rules.
    pub fn rules(&self) -> RuleSet {
        RuleSet {
            limits: self.limits.clone(),
        }
    }
}
