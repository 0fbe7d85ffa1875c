//! Error handling for broker connection operations.
//!
//! `TransferError` is the single error type surfaced by this crate. It covers
//! configuration problems caught while building a client, connection failures
//! reported by either broker session variant, and retry exhaustion.
//!
//! # Error Categories
//!
//! **Configuration Errors** (caught at startup):
//! - `ClientSetup`: TLS files, unsupported options
//! - `ConfigError`: validation failures in settings
//! - `InvalidQos`: a QoS level outside 0..=2
//!
//! **Runtime Errors**:
//! - `ClientTransfer` / `ClientTransferV5`: the local client could not queue a request
//! - `ClientConnection` / `ClientConnectionV5`: network-level connection error
//! - `ConnectTimeout`: no CONNACK within the configured window
//! - `RetriesPolicy`: bounded retries exhausted (fatal for the owning worker)
//! - `Cancelled`: the owner cancelled a connect or reconnect in progress
//! - `Io`: file I/O errors (certificate loading)

use thiserror::Error;

/// The unified error type for broker operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// MQTT client initialization failed.
    ///
    /// Usually a TLS certificate that cannot be read or an option combination
    /// the selected protocol cannot express.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// QoS level is not 0, 1 or 2.
    #[error("Invalid QoS value {0}, must be 0, 1, or 2")]
    InvalidQos(u8),

    /// MQTT 3.1.1 client failed to queue a request.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// MQTT 5 client failed to queue a request.
    #[error("Client transfer error: {0}")]
    ClientTransferV5(#[from] rumqttc::v5::ClientError),

    /// MQTT 3.1.1 connection to the broker failed or was lost.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// MQTT 5 connection to the broker failed or was lost.
    #[error("Client connection error: {0}")]
    ClientConnectionV5(#[from] Box<rumqttc::v5::ConnectionError>),

    /// The broker did not acknowledge the connection in time.
    #[error("No CONNACK received within {0} seconds")]
    ConnectTimeout(u64),

    /// Retry policy exhausted (max connection attempts exceeded).
    ///
    /// The session cannot be brought back; the worker owning it has to stop.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    /// The owner cancelled the connection attempt while it was waiting to
    /// retry.
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// I/O operation failed (certificate loading, not network).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Returns true when the error means the connection cannot be recovered
    /// by the current session owner.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::RetriesPolicy(_)
                | TransferError::Cancelled
                | TransferError::ClientSetup(_)
                | TransferError::ConfigError(_)
        )
    }
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

impl From<rumqttc::v5::ConnectionError> for TransferError {
    fn from(err: rumqttc::v5::ConnectionError) -> Self {
        TransferError::ClientConnectionV5(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffError;

    #[test]
    fn test_transfer_error_display() {
        let err = TransferError::InvalidQos(3);
        assert_eq!(err.to_string(), "Invalid QoS value 3, must be 0, 1, or 2");
    }

    #[test]
    fn test_transfer_error_client_setup() {
        let err = TransferError::ClientSetup("TLS certificate not found".into());
        assert!(err.to_string().contains("TLS certificate not found"));
    }

    #[test]
    fn test_transfer_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let transfer_err: TransferError = io_err.into();
        assert!(transfer_err.to_string().contains("file not found"));
        assert!(!transfer_err.is_fatal());
    }

    #[test]
    fn test_transfer_error_from_connection_error_is_boxed() {
        let conn_err = rumqttc::ConnectionError::NetworkTimeout;
        let transfer_err: TransferError = conn_err.into();
        assert!(matches!(transfer_err, TransferError::ClientConnection(_)));
        assert!(!transfer_err.is_fatal());
    }

    #[test]
    fn test_retries_policy_is_fatal() {
        let err = TransferError::from(BackoffError::MaxAttemptLimitError(5));
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Retry policy error: Maximum number of attempts exceeded: 5"
        );
    }

    #[test]
    fn test_transfer_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(TransferError::ConnectTimeout(30));
        assert_eq!(err.to_string(), "No CONNACK received within 30 seconds");
    }
}
