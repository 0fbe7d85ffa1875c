//! Connection state of the broker session.
//!
//! The Connection Manager publishes every transition through a watch
//! channel so the owning service can observe it without touching the
//! session itself.
//!
//! # Examples
//!
//! ```ignore
//! use wxbee_mqtt::ConnectionState;
//!
//! let state = ConnectionState::Failed("Maximum number of attempts exceeded: 5".into());
//! println!("Status: {}", state);  // "Failed (Maximum number of attempts exceeded: 5)"
//! println!("Type: {}", state.as_str());  // "Failed"
//! ```

use std::fmt;

/// Represents the current state of the broker connection.
///
/// The lifecycle flows through these states:
/// - `Disconnected` -> `Connecting` -> `Connected` (successful handshake)
/// - `Connected` -> `Disconnected` (broker closed, network error, clean shutdown)
/// - `Connecting` -> `Failed` (retries exhausted)
///
/// `Failed` is terminal for the session that reached it. A new session has
/// to be opened by a new worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection. The `String` carries the reason, if one is known.
    Disconnected(String),

    /// Connect or reconnect attempts are in progress.
    Connecting,

    /// The broker acknowledged the connection.
    Connected,

    /// Bounded retries were exhausted.
    Failed(String),
}

impl ConnectionState {
    /// Returns a short string identifier for the current state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failed(_) => "Failed",
        }
    }

    /// Returns contextual details about the current state.
    ///
    /// Empty for `Connecting` and `Connected`.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Connecting | ConnectionState::Connected => String::new(),
            ConnectionState::Disconnected(reason) | ConnectionState::Failed(reason) => {
                reason.clone()
            }
        }
    }

    /// Checks if the connection is currently active.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Checks if the session gave up for good.
    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected(String::new())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
