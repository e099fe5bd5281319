//! Configuration Loader
//!
//! Environment-aware layered loading: built-in defaults, then
//! `<dir>/command-bus.toml`, then `<dir>/command-bus.<environment>.toml`, then
//! `COMMAND_BUS__SECTION__FIELD` environment variables. Missing files are skipped.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ::config::{Config, Environment, File};
use tracing::debug;

use super::error::ConfigResult;
use super::CommandBusConfig;

const BASE_FILE: &str = "command-bus.toml";
const ENV_PREFIX: &str = "COMMAND_BUS";

/// Loaded, validated configuration plus the environment it was resolved for
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: CommandBusConfig,
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

    /// Load configuration from a specific directory with an explicit environment.
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            config_directory = %config_directory.display(),
            "Loading command bus configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        tracing::info!(
            environment = %environment,
            service_name = %config.service_name,
            topic = %config.consumer.topic,
            dead_letter_topic = %config.consumer.dead_letter_topic,
            idempotency_failure_mode = config.idempotency.failure_mode.as_str(),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already constructed configuration after validating it
    pub fn from_config(config: CommandBusConfig, environment: &str) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        })
    }

    pub fn config(&self) -> &CommandBusConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Current environment from `COMMAND_BUS_ENV`, then `APP_ENV`
    pub fn detect_environment() -> String {
        env::var("COMMAND_BUS_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("COMMAND_BUS_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn build(config_directory: &Path, environment: &str) -> ConfigResult<CommandBusConfig> {
        let base_file = config_directory.join(BASE_FILE);
        let env_file = config_directory.join(format!("command-bus.{environment}.toml"));

        let layered = Config::builder()
            .add_source(Config::try_from(&CommandBusConfig::default())?)
            .add_source(File::from(base_file.as_path()).required(false))
            .add_source(File::from(env_file.as_path()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("retry.delay_schedule_ms"),
            )
            .build()?;

        Ok(layered.try_deserialize::<CommandBusConfig>()?)
    }
}
