//! Logging configuration structures and validation logic.
//!
//! The `[logger]` section of the configuration file. All structures
//! deserialize with defaults and are validated with `validator` before the
//! tracing subscriber is built.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Available formats for console log output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Timestamp representation in log entries.
///
/// `Custom` takes a `time` format description such as
/// `"[hour]:[minute]:[second]"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampFormat {
    #[default]
    Rfc3339,
    Unix,
    Custom(String),
}

/// Top-level logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global log level. Valid values: trace, debug, info, warn, error (case-insensitive).
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,

    /// Timestamp format used by the console output.
    #[validate(custom(function = "validate_timestamp_format"))]
    pub timestamp_format: TimestampFormat,
}

fn validate_timestamp_format(format: &TimestampFormat) -> Result<(), ValidationError> {
    let TimestampFormat::Custom(description) = format else {
        return Ok(());
    };
    if description.is_empty() {
        let mut err = ValidationError::new("invalid_timestamp_format");
        err.message = Some("Custom timestamp format cannot be empty".into());
        return Err(err);
    }
    if let Err(e) = time::format_description::parse(description) {
        let mut err = ValidationError::new("invalid_timestamp_format");
        err.message = Some(format!("Invalid timestamp format '{description}': {e}").into());
        return Err(err);
    }
    Ok(())
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {level}").into());
            Err(err)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            timestamp_format: TimestampFormat::default(),
            console: Some(ConsoleConfig::default()),
            journald: Some(JournaldConfig::default()),
        }
    }
}

/// Configuration for console log output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,

    pub format: LogFormat,

    /// Include the log target (module path) in output.
    pub show_target: bool,

    pub show_thread_ids: bool,

    /// Include span close events in output.
    pub show_spans: bool,

    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// Configuration for systemd journald output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JournaldConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Identifier used for journal entries.
    #[validate(length(min = 1))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "wxbee".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logger_config_is_valid() {
        let config = LoggerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.journald.unwrap().identifier, "wxbee");
    }

    #[test]
    fn test_rejects_unknown_level() {
        let config = LoggerConfig {
            level: "loud".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level: loud"));
    }

    #[test]
    fn test_custom_timestamp_format_is_parsed() {
        let good = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour]:[minute]:[second]".into()),
            ..Default::default()
        };
        assert!(good.validate().is_ok());

        let bad = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour".into()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let empty = LoggerConfig {
            timestamp_format: TimestampFormat::Custom(String::new()),
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_console_section_from_toml() {
        let config: LoggerConfig = toml::from_str(
            r#"
            level = "debug"

            [console]
            format = "json"
            ansi_colors = false
            "#,
        )
        .unwrap();

        let console = config.console.unwrap();
        assert_eq!(console.format, LogFormat::Json);
        assert!(console.enabled);
        assert!(!console.ansi_colors);
        let journald = config.journald.unwrap();
        assert!(!journald.enabled);
        assert_eq!(journald.identifier, "wxbee");
    }
}
