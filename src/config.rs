//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{KeyBuilder, PolicyRegistry, PolicyRule};
use crate::store::RedisStoreConfig;

/// Environment variable prefix for configuration overrides, e.g.
/// `TURNSTILE__STORE__URL`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behavior shared by the integration adapters
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Ordered route policies; the first match wins
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Connection settings for the Redis store.
    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            url: self.url.clone(),
            connect_timeout: self.connect_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_operation_timeout_ms() -> u64 {
    500
}

/// What an integration adapter does when the store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the call through.
    #[default]
    Open,
    /// Reject the call with a store-unavailable error.
    Closed,
}

/// Limiter behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace prefix of every route window key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Separator between key components
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Behavior when the store is unavailable
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            separator: default_separator(),
            failure_mode: FailureMode::default(),
        }
    }
}

impl LimiterConfig {
    pub fn key_builder(&self) -> Result<KeyBuilder> {
        KeyBuilder::new(self.key_prefix.as_str(), self.separator.as_str())
    }
}

fn default_key_prefix() -> String {
    "rate_limit_sliding_window".to_string()
}

fn default_separator() -> String {
    ":".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply
    /// `TURNSTILE__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Build the policy registry, failing on the first malformed rule.
    pub fn registry(&self) -> Result<PolicyRegistry> {
        PolicyRegistry::from_rules(&self.policies)
    }

    /// Check everything that can be checked without a store connection.
    pub fn validate(&self) -> Result<()> {
        self.limiter.key_builder()?;
        self.registry()?;
        if self.store.operation_timeout_ms == 0 || self.store.connect_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
