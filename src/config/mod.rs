//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;
mod upstream;
mod workers;

pub use messaging::{AmqpConfig, MessagingConfig, MessagingType};
pub use storage::{StorageConfig, StorageType};
pub use upstream::{
    UpstreamConfig, DEFAULT_ERROR_LIMIT_CEILING, DEFAULT_ERROR_LIMIT_THRESHOLD,
    DEFAULT_INTER_REQUEST_DELAY_MS, DEFAULT_REQUEST_CEILING,
};
pub use workers::{OrchestratorConfig, StageTimeouts, WorkerConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "killfeed.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "KILLFEED_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "KILLFEED";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "KILLFEED_LOG";

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue broker configuration.
    pub messaging: MessagingConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Upstream API and rate limiter configuration.
    pub upstream: UpstreamConfig,
    /// Worker runtime configuration.
    pub workers: WorkerConfig,
    /// Orchestrator configuration.
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `killfeed.yaml` in current directory (if exists)
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
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.messaging.messaging_type = MessagingType::Memory;
        config.storage.storage_type = StorageType::Memory;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.messaging.messaging_type, MessagingType::Memory);
        assert_eq!(config.storage.storage_type, StorageType::Sqlite);
        assert_eq!(config.upstream.inter_request_delay_ms, 100);
        assert_eq!(config.upstream.error_limit_threshold, 10);
        assert_eq!(config.workers.prefetch, 10);
        assert!(config.workers.max_attempts.is_none());
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.storage.storage_type, StorageType::Memory);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "messaging:\n  type: amqp\n  amqp:\n    url: amqp://rabbit:5672\nworkers:\n  prefetch: 3\n  max_attempts: 5\norchestrator:\n  run_hour_utc: 4"
        )
        .unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();

        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.amqp.url, "amqp://rabbit:5672");
        assert_eq!(config.workers.prefetch, 3);
        assert_eq!(config.workers.max_attempts, Some(5));
        assert_eq!(config.orchestrator.run_hour_utc, 4);
        // Untouched sections keep their defaults
        assert_eq!(config.upstream.error_limit_ceiling, 100);
    }
}
