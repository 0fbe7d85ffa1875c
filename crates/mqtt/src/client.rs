//! MQTT client builder with TLS, credentials and last-will support.
//!
//! `ClientBuilder` collects everything both protocol generations need (client
//! id, broker address, keep-alive, credentials, transport, will) and turns it
//! into either a 3.1.1 or a 5.0 `rumqttc` client/event-loop pair.
//!
//! # Examples
//!
//! ```ignore
//! use wxbee_mqtt::{ClientBuilder, Config};
//!
//! let config = Config::default();
//! let (client, event_loop) = ClientBuilder::from_config(&config)?.build_v4()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{TlsConfiguration, Transport};
use tracing::{debug, warn};

use super::{
    config::{Config, LwtConfig, TlsConfig},
    error::TransferError,
};

/// The will message registered with the broker on connect.
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl From<&LwtConfig> for WillMessage {
    fn from(lwt: &LwtConfig) -> Self {
        WillMessage {
            topic: lwt.topic.clone(),
            payload: lwt.offline_payload.clone().into_bytes(),
            qos: lwt.qos,
            retain: lwt.retain,
        }
    }
}

/// Builder for constructing MQTT clients.
///
/// The builder is consumed by one of the `build_*` methods, which return the
/// client (to send requests) and its event loop (to drive the network).
#[derive(Debug)]
pub struct ClientBuilder {
    client_id: String,
    host: String,
    port: u16,
    keep_alive: Duration,
    credentials: Option<(String, String)>,
    max_inflight: u16,

    /// Capacity of the client's request channel.
    cap: usize,

    tls_config: Option<TlsConfig>,
    last_will: Option<WillMessage>,
}

impl ClientBuilder {
    /// Creates a new builder with minimal configuration.
    ///
    /// An empty `client_id` is replaced by a generated one.
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cap: usize,
    ) -> Result<Self, TransferError> {
        let client_id = client_id.into();
        Ok(Self {
            client_id: if client_id.is_empty() {
                generate_client_id()
            } else {
                client_id
            },
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(60),
            credentials: None,
            max_inflight: 100,
            cap: cap.max(1),
            tls_config: None,
            last_will: None,
        })
    }

    /// Creates a builder from a validated `Config`.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        let mut builder = Self::new(
            config.clientid.clone(),
            config.host.clone(),
            config.port,
            config.request_channel_capacity,
        )?
        .keep_alive(config.keepalive)
        .max_inflight(config.max_inflight);

        match (&config.username, &config.password) {
            (Some(username), password) => {
                let password = password.as_ref().map(|p| p.expose()).unwrap_or_default();
                builder = builder.credentials(username.clone(), password);
            }
            (None, Some(_)) => warn!("A broker password is configured without a username, ignoring it"),
            (None, None) => {}
        }

        if let Some(tls) = config.active_tls() {
            builder = builder.with_tls(tls.clone());
        }

        if let Some(lwt) = config.active_lwt() {
            builder = builder.set_last_will(lwt);
        }

        Ok(builder)
    }

    /// The client id that will be presented to the broker.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Enables TLS with the given settings.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls_config = Some(tls);
        self
    }

    /// Sets the keep-alive interval (in seconds).
    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.keep_alive = Duration::from_secs(secs);
        self
    }

    /// Sets broker authentication credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the maximum number of inflight QoS 1 and 2 publishes.
    pub fn max_inflight(mut self, max: u16) -> Self {
        self.max_inflight = max.max(1);
        self
    }

    /// Registers the offline payload of `lwt` as the will message.
    pub fn set_last_will(mut self, lwt: &LwtConfig) -> Self {
        self.last_will = Some(WillMessage::from(lwt));
        self
    }

    /// Loads a certificate file from disk and returns its contents.
    fn load_file(path: &str) -> Result<Vec<u8>, TransferError> {
        Ok(fs::read(path)?)
    }

    /// Builds the network transport: plain TCP, or TLS with the configured
    /// certificates.
    ///
    /// The rustls transport always verifies the broker and negotiates
    /// TLS 1.2 or newer with its own cipher suites, so `certs_required`,
    /// `tls_version` and `ciphers` are validated and reported but cannot
    /// weaken the handshake.
    fn build_transport(&self) -> Result<Transport, TransferError> {
        let Some(tls_config) = self.tls_config.as_ref() else {
            return Ok(Transport::Tcp);
        };

        tls_config.validate_config()?;

        match tls_config.certs_required.to_lowercase().as_str() {
            "required" => {}
            other => warn!(
                "certs_required = {} is not supported by the TLS transport, the broker certificate is still verified",
                other
            ),
        }
        match tls_config.tls_version.to_lowercase().as_str() {
            "tls" | "tlsv12" => {}
            other => warn!(
                "tls_version = {} requested, the TLS transport negotiates TLS 1.2 or newer",
                other
            ),
        }
        if let Some(ciphers) = &tls_config.ciphers {
            warn!("Ignoring cipher list '{}', the TLS transport uses its own suites", ciphers);
        }

        let Some(ca_path) = tls_config.ca_certs.as_deref() else {
            if tls_config.has_client_auth() {
                return Err(TransferError::ClientSetup(
                    "Client certificates require 'ca_certs' to be set".into(),
                ));
            }
            debug!("TLS enabled with platform root certificates");
            return Ok(Transport::tls_with_default_config());
        };

        let ca = Self::load_file(ca_path)?;

        let client_auth = match (&tls_config.certfile, &tls_config.keyfile) {
            (Some(cert), Some(key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            _ => None,
        };

        debug!(
            "TLS enabled with CA {} (client auth: {})",
            ca_path,
            client_auth.is_some()
        );

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    /// Constructs an MQTT 3.1.1 client and event loop.
    pub fn build_v4(self) -> Result<(rumqttc::AsyncClient, rumqttc::EventLoop), TransferError> {
        let transport = self.build_transport()?;

        let mut opts = rumqttc::MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        opts.set_inflight(self.max_inflight);
        opts.set_transport(transport);

        if let Some((username, password)) = &self.credentials {
            opts.set_credentials(username.clone(), password.clone());
        }

        if let Some(will) = &self.last_will {
            opts.set_last_will(rumqttc::LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                qos_v4(will.qos)?,
                will.retain,
            ));
        }

        Ok(rumqttc::AsyncClient::new(opts, self.cap))
    }

    /// Constructs an MQTT 5 client and event loop.
    pub fn build_v5(
        self,
    ) -> Result<(rumqttc::v5::AsyncClient, rumqttc::v5::EventLoop), TransferError> {
        let transport = self.build_transport()?;

        let mut opts =
            rumqttc::v5::MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_start(true);
        opts.set_transport(transport);

        if let Some((username, password)) = &self.credentials {
            opts.set_credentials(username.clone(), password.clone());
        }

        if let Some(will) = &self.last_will {
            opts.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                qos_v5(will.qos)?,
                will.retain,
                None,
            ));
        }

        Ok(rumqttc::v5::AsyncClient::new(opts, self.cap))
    }
}

/// Maps a numeric QoS level onto the 3.1.1 client's enum.
pub fn qos_v4(level: u8) -> Result<rumqttc::QoS, TransferError> {
    match level {
        0 => Ok(rumqttc::QoS::AtMostOnce),
        1 => Ok(rumqttc::QoS::AtLeastOnce),
        2 => Ok(rumqttc::QoS::ExactlyOnce),
        other => Err(TransferError::InvalidQos(other)),
    }
}

/// Maps a numeric QoS level onto the 5.0 client's enum.
pub fn qos_v5(level: u8) -> Result<rumqttc::v5::mqttbytes::QoS, TransferError> {
    use rumqttc::v5::mqttbytes::QoS;

    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransferError::InvalidQos(other)),
    }
}

fn generate_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("wxbee-{}", &id[..8])
}
