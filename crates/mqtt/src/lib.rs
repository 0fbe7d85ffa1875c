//! # wxbee-mqtt: publish-only broker connection for wxbee
//!
//! Wraps `rumqttc` with the connection behaviour the weather publisher
//! needs:
//!
//! - **Bounded connect/retry** with a fixed or exponential delay
//! - **Lazy reconnect** before a publish when the connection was lost
//! - **Presence payloads**: an offline last will plus an online message on
//!   every connect
//! - **TLS** with CA-only or mutual authentication
//! - **Two protocol generations** (3.1.1 and 5.0) behind one session trait
//! - **State monitoring** through a watch channel
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     Dispatch worker (wxbee)          │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │     ConnectionManager                │
//! │ Backoff, ConnectionState, LWT        │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │     BrokerSession                    │
//! │ V4Session | V5Session                │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │     rumqttc (ClientBuilder)          │
//! │ AsyncClient, EventLoop, TCP/TLS      │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use wxbee_mqtt::{Config, ConnectionManager, ConnectionState, RumqttcSessions, SessionFactory};
//!
//! let config = Config::default();
//! let session = RumqttcSessions.open(&config)?;
//! let (state_tx, _state_rx) = tokio::sync::watch::channel(ConnectionState::default());
//!
//! let mut manager = ConnectionManager::new(session, &config, Arc::new(state_tx));
//! manager.connect().await?;
//! manager.publish(None, 0, false, "weather/loop", b"{}".to_vec()).await?;
//! manager.disconnect().await;
//! ```
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result`]. Only errors for which
//! [`TransferError::is_fatal`] is true should stop the caller; the rest
//! concern a single message.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod state;

pub use backoff::{Backoff, BackoffError};
pub use client::ClientBuilder;
pub use config::{Config, LwtConfig, Password, Protocol, TlsConfig};
pub use connection::ConnectionManager;
pub use error::TransferError;
pub use session::{BrokerSession, RumqttcSessions, SessionEvent, SessionFactory};
pub use state::ConnectionState;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, TransferError>;
