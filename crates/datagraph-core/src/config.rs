use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for DataGraph
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DataGraphConfig {
    /// Store behaviour
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Run pending canonical flushes at the end of every top-level store call.
    /// When false the caller drives flushing with `Store::flush`.
    #[serde(default = "default_true")]
    pub auto_flush: bool,

    /// Reject attribute keys the schema does not declare
    #[serde(default = "default_true")]
    pub strict_attributes: bool,

    /// Prefix for generated lids
    #[serde(default = "default_lid_prefix")]
    pub lid_prefix: String,

    /// Turns a destroyed entry stays readable through `peek_destroyed`.
    /// 0 releases immediately.
    #[serde(default)]
    pub destroyed_retention_turns: u32,

    /// Capacity of the broadcast notification channel
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            auto_flush: true,
            strict_attributes: true,
            lid_prefix: default_lid_prefix(),
            destroyed_retention_turns: 0,
            notification_buffer: default_notification_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_lid_prefix() -> String {
    crate::identifier_cache::DEFAULT_LID_PREFIX.to_string()
}
fn default_notification_buffer() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug)]
pub struct ConfigManager {
    config: DataGraphConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from file, environment and defaults.
    pub fn load() -> Result<Self, ConfigError> {
        info!("Loading DataGraph configuration...");

        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        match config_path {
            Some(ref path) => info!("Config file: {}", path.display()),
            None => info!("Config file: NONE (using defaults)"),
        }
        info!(
            "auto_flush={} strict_attributes={} destroyed_retention_turns={}",
            config.store.auto_flush,
            config.store.strict_attributes,
            config.store.destroyed_retention_turns
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load an explicit config file; missing files are an error here.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let config = Self::apply_env_overrides(Self::read_toml_file(path)?);
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Search order:
    /// 1. ./.datagraph.toml (current directory)
    /// 2. ~/.datagraph/config.toml (user config)
    /// 3. Use defaults
    fn load_config_file() -> Result<(DataGraphConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".datagraph.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".datagraph").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        info!("No config file found, using defaults");
        Ok((DataGraphConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<DataGraphConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(mut config: DataGraphConfig) -> DataGraphConfig {
        if let Ok(value) = std::env::var("DATAGRAPH_AUTO_FLUSH") {
            if let Ok(flag) = value.parse() {
                config.store.auto_flush = flag;
            }
        }
        if let Ok(value) = std::env::var("DATAGRAPH_STRICT_ATTRIBUTES") {
            if let Ok(flag) = value.parse() {
                config.store.strict_attributes = flag;
            }
        }
        if let Ok(prefix) = std::env::var("DATAGRAPH_LID_PREFIX") {
            config.store.lid_prefix = prefix;
        }
        if let Ok(value) = std::env::var("DATAGRAPH_DESTROYED_RETENTION_TURNS") {
            if let Ok(turns) = value.parse() {
                config.store.destroyed_retention_turns = turns;
            }
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            // only plain levels; directive strings are left to EnvFilter
            if matches!(
                level.as_str(),
                "trace" | "debug" | "info" | "warn" | "error"
            ) {
                config.logging.level = level;
            }
        }
        if let Ok(format) = std::env::var("DATAGRAPH_LOG_FORMAT") {
            config.logging.format = format;
        }
        config
    }

    pub fn validate_config(config: &DataGraphConfig) -> Result<(), ConfigError> {
        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        if config.store.lid_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "lid_prefix must not be empty".to_string(),
            ));
        }

        if config.store.notification_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "notification_buffer must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn config(&self) -> &DataGraphConfig {
        &self.config
    }

    pub fn into_config(self) -> DataGraphConfig {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Write the default configuration to `path`, creating parent directories.
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(&DataGraphConfig::default())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
