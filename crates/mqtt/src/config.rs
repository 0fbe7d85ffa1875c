//! Configuration structures for the broker connection.
//!
//! All configurations support serde deserialization and are validated with
//! the `validator` crate, so invalid settings fail at load time rather than
//! at connect time. The root crate flattens [`Config`] into its `[publish]`
//! section, which is why field names follow the flat `host`, `port`,
//! `keepalive` style instead of nested tables.
//!
//! # Examples
//!
//! ```toml
//! host = "mqtt.example.com"
//! port = 8883
//! protocol = "MQTTv5"
//! max_retries = 5
//!
//! [tls]
//! ca_certs = "/etc/ssl/certs/ca.pem"
//! tls_version = "tlsv12"
//!
//! [lwt]
//! topic = "weather/status"
//! ```

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::TransferError;

/// Certificate requirements accepted by `tls.certs_required`.
pub const CERTS_REQUIRED: &[&str] = &["none", "optional", "required"];

/// Protocol names accepted by `tls.tls_version`.
pub const TLS_VERSIONS: &[&str] = &["tls", "tlsv1", "tlsv11", "tlsv12", "sslv2", "sslv23", "sslv3"];

/// Wire protocol version used to talk to the broker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Protocol {
    /// MQTT 3.1, served by the 3.1.1 session.
    #[serde(rename = "MQTTv31")]
    V31,
    #[default]
    #[serde(rename = "MQTTv311")]
    V311,
    #[serde(rename = "MQTTv5")]
    V5,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::V31 => "MQTTv31",
            Protocol::V311 => "MQTTv311",
            Protocol::V5 => "MQTTv5",
        })
    }
}

/// Broker password. Never printed by `Debug`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Password(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

/// Main broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Broker hostname or IP address.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port number (1883 plain, 8883 TLS).
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Maximum period in seconds between communications with the broker.
    ///
    /// The dispatch worker also uses a quarter of this value as its idle
    /// wake-up interval.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keepalive: u64,

    /// Wire protocol version.
    pub protocol: Protocol,

    /// Client identifier. Generated (`wxbee-xxxxxxxx`) when empty.
    #[validate(length(max = 65535, message = "Client ID must not exceed 65535 characters"))]
    pub clientid: String,

    /// Broker username.
    pub username: Option<String>,

    /// Broker password. Only sent together with `username`.
    pub password: Option<Password>,

    /// Connect/reconnect attempts before the session gives up.
    #[validate(range(max = 100, message = "Max retries must be between 0 and 100"))]
    pub max_retries: u32,

    /// Seconds between connect attempts.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Retry delay must be between 1 and 3600 seconds"
    ))]
    pub retry_delay: u64,

    /// Multiplier applied to the retry delay after every attempt.
    ///
    /// 1.0 keeps the delay fixed.
    #[validate(range(
        min = 1.0,
        max = 30.0,
        message = "Retry backoff must be between 1 and 30"
    ))]
    pub retry_backoff: f64,

    /// Upper bound for the retry delay when `retry_backoff > 1`.
    #[validate(range(
        min = 1,
        max = 86400,
        message = "Max retry delay must be between 1 and 86400 seconds"
    ))]
    pub max_retry_delay: u64,

    /// Seconds to wait for CONNACK on each attempt.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connect timeout must be between 1 and 300 seconds"
    ))]
    pub connect_timeout: u64,

    /// Log every raw broker event at debug level.
    #[serde(alias = "mqtt_log")]
    pub log_mqtt: bool,

    /// Maximum number of QoS 1 and QoS 2 messages in flight simultaneously.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Capacity of the client's request channel.
    #[validate(range(
        min = 1,
        max = 10000,
        message = "Request channel capacity must be between 1 and 10000"
    ))]
    pub request_channel_capacity: usize,

    /// Optional TLS configuration. Active when present and enabled.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    /// Optional last-will configuration. Active when present and enabled.
    #[validate(nested)]
    pub lwt: Option<LwtConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            keepalive: 60,
            protocol: Protocol::default(),
            clientid: String::new(),
            username: None,
            password: None,
            max_retries: 5,
            retry_delay: 5,
            retry_backoff: 1.0,
            max_retry_delay: 60,
            connect_timeout: 30,
            log_mqtt: false,
            max_inflight: 100,
            request_channel_capacity: 100,
            tls: None,
            lwt: None,
        }
    }
}

impl Config {
    /// TLS settings, if configured and enabled.
    pub fn active_tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref().filter(|tls| tls.enable)
    }

    /// Last-will settings, if configured and enabled.
    pub fn active_lwt(&self) -> Option<&LwtConfig> {
        self.lwt.as_ref().filter(|lwt| lwt.enable)
    }
}

/// TLS settings for secure broker connections.
///
/// Files are checked at load time by validation and again when the client
/// is built.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// Turns TLS on and off while keeping the section in place.
    pub enable: bool,

    /// CA certificate (PEM) trusted for the broker. The platform roots are
    /// used when absent.
    #[validate(custom(function = "validate_file_path"))]
    pub ca_certs: Option<String>,

    /// Client certificate (PEM). Requires `keyfile`.
    #[validate(custom(function = "validate_file_path"))]
    pub certfile: Option<String>,

    /// Client private key (PEM, unencrypted). Requires `certfile`.
    #[validate(custom(function = "validate_file_path"))]
    pub keyfile: Option<String>,

    /// Certificate requirements the client imposes on the broker.
    #[validate(custom(function = "validate_certs_required"))]
    pub certs_required: String,

    /// SSL/TLS protocol version name.
    #[validate(custom(function = "validate_tls_version"))]
    pub tls_version: String,

    /// Allowed cipher list.
    pub ciphers: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            enable: true,
            ca_certs: None,
            certfile: None,
            keyfile: None,
            certs_required: "required".to_string(),
            tls_version: "tlsv12".to_string(),
            ciphers: None,
        }
    }
}

impl TlsConfig {
    /// Creates a TLS configuration with CA-only verification (no client auth).
    pub fn with_ca_only(ca_certs: impl Into<String>) -> Self {
        TlsConfig {
            ca_certs: Some(ca_certs.into()),
            ..Default::default()
        }
    }

    /// Creates a TLS configuration with mutual authentication.
    pub fn with_client_auth(
        ca_certs: impl Into<String>,
        certfile: impl Into<String>,
        keyfile: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_certs: Some(ca_certs.into()),
            certfile: Some(certfile.into()),
            keyfile: Some(keyfile.into()),
            ..Default::default()
        }
    }

    /// Returns true only if BOTH client certificate and key are specified.
    pub fn has_client_auth(&self) -> bool {
        self.certfile.is_some() && self.keyfile.is_some()
    }

    /// Validates the TLS configuration before the client is built.
    ///
    /// Checks the option names, that every configured file is readable, and
    /// that the client certificate and key come as a pair.
    pub fn validate_config(&self) -> Result<(), TransferError> {
        let setup = |e: ValidationError| TransferError::ClientSetup(describe(&e));

        validate_certs_required(&self.certs_required).map_err(setup)?;
        validate_tls_version(&self.tls_version).map_err(setup)?;

        if let Some(ca) = &self.ca_certs {
            validate_file_path(ca).map_err(setup)?;
        }

        if self.has_client_auth() {
            if let (Some(cert), Some(key)) = (&self.certfile, &self.keyfile) {
                validate_file_path(cert).map_err(setup)?;
                validate_file_path(key).map_err(setup)?;
            }
        } else if self.certfile.is_some() || self.keyfile.is_some() {
            return Err(TransferError::ClientSetup(
                "Both client certificate and key must be provided or neither".into(),
            ));
        }

        Ok(())
    }
}

/// Last-will-and-testament settings.
///
/// The offline payload is registered as the will; the online payload is
/// published to the same topic every time the broker accepts a connection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LwtConfig {
    pub enable: bool,

    #[validate(length(min = 1, message = "LWT topic must not be empty"))]
    pub topic: String,

    pub online_payload: String,

    pub offline_payload: String,

    #[validate(range(max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    pub retain: bool,
}

impl Default for LwtConfig {
    fn default() -> Self {
        LwtConfig {
            enable: true,
            topic: "status".to_string(),
            online_payload: "online".to_string(),
            offline_payload: "offline".to_string(),
            qos: 0,
            retain: true,
        }
    }
}

fn describe(err: &ValidationError) -> String {
    err.message
        .as_ref()
        .map(|m| m.to_string())
        .unwrap_or_else(|| err.code.to_string())
}

fn validate_certs_required(value: &str) -> Result<(), ValidationError> {
    if CERTS_REQUIRED.contains(&value.to_lowercase().as_str()) {
        return Ok(());
    }
    Err(ValidationError::new("invalid_certs_required")
        .with_message(format!("Invalid 'certs_required', {value}").into()))
}

fn validate_tls_version(value: &str) -> Result<(), ValidationError> {
    if TLS_VERSIONS.contains(&value.to_lowercase().as_str()) {
        return Ok(());
    }
    Err(ValidationError::new("invalid_tls_version")
        .with_message(format!("Invalid 'tls_version', {value}").into()))
}

/// Validates that a file exists, is readable, and is actually a file.
fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    if std::fs::File::open(path_obj).is_err() {
        return Err(ValidationError::new("file_not_readable")
            .with_message(format!("File is not readable: {path}").into()));
    }

    Ok(())
}
