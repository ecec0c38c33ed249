//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered with the
//! `config` crate, lowest precedence first:
//!
//! 1. Compiled-in defaults ([`ModHubConfig::default`])
//! 2. `<dir>/modhub.yaml`
//! 3. `<dir>/modhub.<environment>.yaml`
//! 4. `MODHUB_<SECTION>__<KEY>` environment variables

use super::error::{ConfigResult, ConfigurationError};
use super::ModHubConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const BASE_FILE_STEM: &str = "modhub";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: ModHubConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let explicit = config_dir.is_some();
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        if explicit && !config_directory.is_dir() {
            return Err(ConfigurationError::directory_not_found(config_directory));
        }

        debug!(
            environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        crate::log_config!(info, "Configuration loaded successfully",
            environment: environment,
            workers: config.message_bus.worker_count,
            max_delivery_attempts: config.message_bus.max_delivery_attempts,
            backend: config.persistence.backend
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (tests, embedded setups)
    pub fn from_config(
        config: ModHubConfig,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &ModHubConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    pub fn is_test_environment(&self) -> bool {
        self.environment == "test"
    }

    /// Configuration as JSON with secrets masked, for logging and the CLI
    pub fn debug_config(&self) -> serde_json::Value {
        let mut value = serde_json::json!(self.config);
        if let Some(url) = value
            .pointer_mut("/persistence/database_url")
            .filter(|v| v.is_string())
        {
            *url = serde_json::Value::String("[MASKED]".to_string());
        }
        value
    }

    fn build(config_directory: &Path, environment: &str) -> ConfigResult<ModHubConfig> {
        let defaults = Config::try_from(&ModHubConfig::default())
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        let base = config_directory.join(BASE_FILE_STEM);
        let env_specific = config_directory.join(format!("{BASE_FILE_STEM}.{environment}"));

        Config::builder()
            .add_source(defaults)
            .add_source(File::with_name(&base.to_string_lossy()).required(false))
            .add_source(File::with_name(&env_specific.to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix("MODHUB")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| ConfigurationError::load_error(environment, e))
    }

    /// Detect environment from environment variables
    fn detect_environment() -> String {
        env::var("MODHUB_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("MODHUB_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}
