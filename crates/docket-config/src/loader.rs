//! Configuration loader with layered sources.

use crate::{AdmissionMode, AppConfig, StoreBackend};
use config::{Config, ConfigError, Environment, File};
use docket_core::DocketError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `DOCKET_` prefix
    pub fn new(config_dir: impl Into<String>) -> Result<Self, DocketError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, DocketError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    pub async fn reload(&self) -> Result<(), DocketError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Loads configuration from the specified directory.
    fn load_config(config_dir: &str) -> Result<AppConfig, DocketError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("DOCKET_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        let default_path = format!("{config_dir}/default.toml");
        if Path::new(&default_path).exists() {
            debug!("Loading default config from: {}", default_path);
            builder = builder.add_source(File::with_name(&default_path).required(false));
        }

        let env_path = format!("{config_dir}/{environment}.toml");
        if Path::new(&env_path).exists() {
            debug!("Loading environment config from: {}", env_path);
            builder = builder.add_source(File::with_name(&env_path).required(false));
        }

        // Not committed to version control
        let local_path = format!("{config_dir}/local.toml");
        if Path::new(&local_path).exists() {
            debug!("Loading local config from: {}", local_path);
            builder = builder.add_source(File::with_name(&local_path).required(false));
        }

        // DOCKET_WORKER__SLEEP=5 -> worker.sleep
        builder = builder.add_source(
            Environment::with_prefix("DOCKET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error_to_docket_error)?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(config_error_to_docket_error)?;

        validate_config(&app_config)?;

        Ok(app_config)
    }
}

/// Validates the configuration.
pub fn validate_config(config: &AppConfig) -> Result<(), DocketError> {
    if config.connections.is_empty() {
        return Err(DocketError::configuration(
            "At least one queue connection must be configured",
        ));
    }

    if !config.connections.contains_key(&config.default_connection) {
        return Err(DocketError::configuration(format!(
            "Default connection '{}' is not defined",
            config.default_connection
        )));
    }

    for (name, conn) in &config.connections {
        if conn.table.is_empty() {
            return Err(DocketError::configuration(format!(
                "Connection '{name}' has an empty table name"
            )));
        }
        if conn.queue.is_empty() {
            return Err(DocketError::configuration(format!(
                "Connection '{name}' has an empty default queue"
            )));
        }
        if conn.expire == 0 {
            return Err(DocketError::configuration(format!(
                "Connection '{name}' must have a visibility timeout above zero"
            )));
        }
        if conn.limit == 0 && conn.admission != AdmissionMode::Unlimited {
            return Err(DocketError::configuration(format!(
                "Connection '{name}' has limit 0 and would never admit a job"
            )));
        }
        if conn.table == config.failed.table {
            warn!(connection = %name, "Queue table and failed table are the same collection");
        }
    }

    if config.failed.table.is_empty() {
        return Err(DocketError::configuration("Failed table name is required"));
    }

    if config.store.backend == StoreBackend::Redis {
        if config.store.redis.url.is_empty() {
            return Err(DocketError::configuration(
                "Redis URL is required for the redis store backend",
            ));
        }
        if config.store.redis.pool_size == 0 {
            return Err(DocketError::configuration("Redis pool size must be above zero"));
        }
    }

    Ok(())
}

fn config_error_to_docket_error(err: ConfigError) -> DocketError {
    DocketError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionConfig, DispatchMode};
    use std::fs;

    #[tokio::test]
    async fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
            default_connection = "thread"

            [connections.thread]
            table = "docket_jobs_thread"
            expire = 90
            limit = 4
            dispatch = "process"

            [worker]
            sleep = 1
            max_tries = 3
            "#,
        )
        .unwrap();

        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        let config = loader.get().await;

        assert_eq!(config.default_connection, "thread");
        let conn = config.connection("thread").unwrap();
        assert_eq!(conn.table, "docket_jobs_thread");
        assert_eq!(conn.expire, 90);
        assert_eq!(conn.limit, 4);
        assert_eq!(conn.dispatch, DispatchMode::Process);
        assert_eq!(config.worker.sleep, 1);
        assert_eq!(config.worker.max_tries, 3);
        assert_eq!(config.worker.memory, 128);
    }

    #[tokio::test]
    async fn test_empty_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.default_connection, "default");
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.toml");
        fs::write(&path, "[worker]\nsleep = 2\n").unwrap();

        let loader = ConfigLoader::new(dir.path().to_string_lossy()).unwrap();
        assert_eq!(loader.get().await.worker.sleep, 2);

        fs::write(&path, "[worker]\nsleep = 7\n").unwrap();
        loader.reload().await.unwrap();
        assert_eq!(loader.get().await.worker.sleep, 7);
    }

    #[test]
    fn test_validate_missing_default_connection() {
        let mut config = AppConfig::default();
        config.default_connection = "nope".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_expire() {
        let mut config = AppConfig::default();
        config.connections.insert(
            "bad".to_string(),
            ConnectionConfig {
                expire: 0,
                ..ConnectionConfig::default()
            },
        );
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_limit_only_when_unlimited() {
        let mut config = AppConfig::default();
        config.connections.insert(
            "throttled".to_string(),
            ConnectionConfig {
                limit: 0,
                ..ConnectionConfig::default()
            },
        );
        assert!(validate_config(&config).is_err());

        config.connections.insert(
            "throttled".to_string(),
            ConnectionConfig {
                limit: 0,
                admission: AdmissionMode::Unlimited,
                ..ConnectionConfig::default()
            },
        );
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_redis_url() {
        let mut config = AppConfig::default();
        config.store.backend = StoreBackend::Redis;
        config.store.redis.url = String::new();
        assert!(validate_config(&config).is_err());
    }
}
