//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod scheduling;
mod storage;

pub use messaging::{MessagingConfig, MessagingType, NatsSettings, TopicsConfig};
pub use scheduling::{
    AckMode, DispatcherConfig, OutboxConfig, PurgeConfig, ReconcilerConfig, ReconnectConfig,
    ServiceConfig,
};
pub use storage::StorageConfig;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "STUDENT_OUTBOX_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "STUDENT_OUTBOX";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "STUDENT_OUTBOX_LOG";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub messaging: MessagingConfig,
    /// Broker reconnect backoff.
    pub reconnect: ReconnectConfig,
    pub outbox: OutboxConfig,
    pub reconciler: ReconcilerConfig,
    pub purge: PurgeConfig,
    pub dispatcher: DispatcherConfig,
    pub service: ServiceConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Invalid("outbox.batch_size must be > 0".to_string()));
        }
        if self.outbox.lock_at_least_ms > self.outbox.lock_at_most_ms {
            return Err(ConfigError::Invalid(
                "outbox.lock_at_least_ms exceeds outbox.lock_at_most_ms".to_string(),
            ));
        }
        if self.dispatcher.workers == 0 {
            return Err(ConfigError::Invalid("dispatcher.workers must be > 0".to_string()));
        }
        if self.reconnect.min_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.min_delay_ms exceeds reconnect.max_delay_ms".to_string(),
            ));
        }
        if self.messaging.topics.command.is_empty() || self.messaging.topics.events.is_empty() {
            return Err(ConfigError::Invalid("messaging topics must not be empty".to_string()));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.storage.path = ":memory:".to_string();
        config.reconnect.jitter = false;
        config
    }
}

#[cfg(test)]
mod tests;
