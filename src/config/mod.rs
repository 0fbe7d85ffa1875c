//! Application configuration loading, validation, and management.
//!
//! The top-level `Config` combines the `[logger]` and `[publish]` sections.
//! It is loaded once at startup from a TOML file, validated, and treated as
//! immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use time::{format_description, OffsetDateTime};
use validator::Validate;

use self::{logger::LoggerConfig, publish::PublishConfig};

pub mod logger;
pub mod publish;

/// Timestamp prefix for the `print_*` macros.
#[doc(hidden)]
pub fn console_timestamp() -> String {
    format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z")
        .ok()
        .and_then(|format| OffsetDateTime::now_utc().format(&format).ok())
        .unwrap_or_default()
}

/// Timestamped messages printed before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors raised while loading the configuration or building the topic
/// registry from it. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing. TLS option errors
    /// (`certs_required`, `tls_version`) surface here.
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("[[topics]] is required.")]
    MissingTopics,

    #[error("Invalid 'period', {0}")]
    InvalidPeriod(String),

    #[error("Topic '{0}': QOS must be greater than 0 to guarantee delivery.")]
    GuaranteeDeliveryQos(String),

    #[error("Topic '{topic}': invalid QoS {qos}, must be 0, 1, or 2")]
    InvalidQos { topic: String, qos: u8 },

    #[error("Invalid 'format', '{template}': {reason}")]
    InvalidFormat { template: String, reason: String },

    #[error("Invalid 'binding', {0}")]
    UnknownBinding(String),

    #[error("Topic '{topic}': aggregate '{aggregate}' requires '{option}'")]
    MissingAggregateOption {
        topic: String,
        aggregate: String,
        option: &'static str,
    },
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Broker connection, service settings and topics.
    #[validate(nested)]
    pub publish: PublishConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Priority: the `WXBEE_CONFIG` environment variable, then
    /// `/etc/wxbee/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var("WXBEE_CONFIG") {
            let path = PathBuf::from(config_path);
            print_info!("Using config from WXBEE_CONFIG: {}", path.display());
            return Ok(path);
        }

        let fallback = Path::new("/etc/wxbee/config.toml");
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config = Self::parse(&fs::read_to_string(path)?)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}
