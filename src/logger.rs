//! Centralized logging initialization.
//!
//! `LoggerManager` validates the `[logger]` section and installs the global
//! `tracing` subscriber with a console layer and/or a systemd journald
//! layer. Each layer is filtered by `RUST_LOG` when set, otherwise by the
//! configured level.

use std::io;

use thiserror::Error;
use time::{
    format_description::{self, well_known::Rfc3339, OwnedFormatItem},
    OffsetDateTime,
};
use tracing::instrument;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// Errors that can occur during logger configuration or initialization.
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// IO error, typically while connecting to the journald socket.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    /// Journald failed while console output was also requested.
    #[error(
        "Failed to initialize journald logger, and console logger is enabled. Please check your configuration."
    )]
    JournaldFailedWithConsoleEnabled,
}

/// Formats event timestamps according to [`TimestampFormat`].
#[derive(Debug, Clone)]
enum LogTimer {
    Rfc3339,
    Unix,
    Custom(OwnedFormatItem),
}

impl LogTimer {
    fn new(format: &TimestampFormat) -> Result<Self, LoggerError> {
        Ok(match format {
            TimestampFormat::Rfc3339 => LogTimer::Rfc3339,
            TimestampFormat::Unix => LogTimer::Unix,
            TimestampFormat::Custom(description) => {
                let items = format_description::parse(description)
                    .map_err(|e| LoggerError::InitializationError(e.to_string()))?;
                LogTimer::Custom(OwnedFormatItem::from(items.as_slice()))
            }
        })
    }
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_utc();
        let formatted = match self {
            LogTimer::Rfc3339 => now.format(&Rfc3339),
            LogTimer::Unix => return write!(w, "{}", now.unix_timestamp()),
            LogTimer::Custom(items) => now.format(items),
        };
        w.write_str(&formatted.map_err(|_| std::fmt::Error)?)
    }
}

/// Manages logging configuration and global subscriber initialization.
pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// Creates a new `LoggerManager` and validates the provided configuration.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    /// Initializes the global `tracing` subscriber with configured layers.
    ///
    /// Must be called once at startup. Fails when no layer can be built, or
    /// when journald fails while console output is also enabled.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let mut layers = Vec::new();
        if let Some(console_config) = self.config.console.as_ref().filter(|c| c.enabled) {
            let console_layer = self.init_console_logger(console_config, self.filter())?;
            layers.push(console_layer);
        }

        if let Some(journald_config) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match self.init_journald_logger(&journald_config.identifier) {
                Ok(journald_layer) => {
                    layers.push(journald_layer);
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald_config.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if self.config.console.as_ref().is_some_and(|c| c.enabled) {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    fn init_console_logger(
        &self,
        config: &ConsoleConfig,
        filter: EnvFilter,
    ) -> Result<BoxedLayer, LoggerError> {
        let timer = LogTimer::new(&self.config.timestamp_format)?;
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_timer(timer)
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        let layer = match config.format {
            LogFormat::Json => base.json().with_filter(filter).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        };

        Ok(layer)
    }

    fn init_journald_logger(&self, identifier: &str) -> Result<BoxedLayer, LoggerError> {
        let journald_layer = tracing_journald::layer()?.with_syslog_identifier(identifier.to_string());
        Ok(journald_layer.with_filter(self.filter()).boxed())
    }
}
