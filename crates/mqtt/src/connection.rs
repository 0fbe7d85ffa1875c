//! Connection Manager: the broker connection state machine.
//!
//! The manager owns one [`BrokerSession`] and drives it through
//! `Disconnected -> Connecting -> Connected`, falling into `Failed` once the
//! bounded retry policy is exhausted. Every transition is broadcast on a
//! watch channel supplied by the owner.
//!
//! # Architecture
//!
//! ```text
//! Dispatch worker
//!     ↓ connect / publish / pump / disconnect
//! ConnectionManager (retry policy, presence payload, state)
//!     ↓
//! BrokerSession (V4Session | V5Session)
//!     ↓
//! rumqttc AsyncClient & EventLoop
//! ```
//!
//! Session events are handled by `on_connect`, `on_disconnect`,
//! `on_publish` and `on_log`. None of them reconnects: a lost connection is
//! re-established lazily by the next `publish`.
//!
//! # Usage
//!
//! ```ignore
//! let session = RumqttcSessions.open(&config)?;
//! let (state_tx, state_rx) = tokio::sync::watch::channel(ConnectionState::default());
//! let mut manager = ConnectionManager::new(session, &config, Arc::new(state_tx));
//!
//! manager.connect().await?;
//! manager.publish(Some(1700000000), 1, false, "weather/loop", payload).await?;
//! manager.disconnect().await;
//! ```

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::Backoff,
    config::{Config, LwtConfig},
    error::TransferError,
    session::{get_error_message, BrokerSession, SessionEvent},
    state::ConnectionState,
};

/// How long the network loop is serviced after a connect attempt or publish.
pub const PUMP_WINDOW: Duration = Duration::from_millis(100);

/// Owns a broker session and its retry policy.
///
/// Single-owner by construction: it lives inside the dispatch worker's task
/// and is never shared.
pub struct ConnectionManager {
    /// The protocol-specific session
    session: Box<dyn BrokerSession>,

    /// Set by `on_connect`, cleared by `on_disconnect`
    connected: bool,

    /// Bounded delay policy for connect and reconnect
    backoff: Backoff,

    /// Presence settings, if a last will is configured
    lwt: Option<LwtConfig>,

    /// Broadcast channel for connection state updates
    state_tx: Arc<watch::Sender<ConnectionState>>,

    /// Interrupts the sleep between retries
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Creates a manager for `session` using the retry settings from `config`.
    pub fn new(
        session: Box<dyn BrokerSession>,
        config: &Config,
        state_tx: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        let mut backoff = Backoff::new(
            Duration::from_secs(config.retry_delay),
            Duration::from_secs(config.max_retry_delay),
            config.retry_backoff,
        );
        backoff.set_max_attempts(config.max_retries);

        Self {
            session,
            connected: false,
            backoff,
            lwt: config.active_lwt().cloned(),
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Makes retry waits end early when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replaces the retry policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether the broker has acknowledged the current connection.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Establishes the initial connection.
    ///
    /// Each attempt is followed by a short pump of the network loop so that
    /// `on_connect` can run. Gives up with `TransferError::RetriesPolicy`
    /// after `max_retries` failed retries, or with `TransferError::Cancelled`
    /// when the cancel token fires during a retry wait.
    pub async fn connect(&mut self) -> Result<(), TransferError> {
        info!("Connecting to broker...");
        self.retry_loop(false).await?;
        Ok(())
    }

    /// Re-establishes a lost connection with the same bounded policy.
    pub async fn reconnect(&mut self) -> Result<(), TransferError> {
        warn!("Not connected, reconnecting to broker...");
        self.retry_loop(true).await?;
        info!("Reconnected");
        Ok(())
    }

    async fn retry_loop(&mut self, reconnect: bool) -> Result<(), TransferError> {
        self.update_state(ConnectionState::Connecting);
        self.backoff.reset();

        loop {
            let attempt = if reconnect {
                self.session.reconnect().await
            } else {
                self.session.connect().await
            };
            if let Err(e) = attempt {
                error!("Failed to connect to broker: {}", get_error_message(&e));
                debug!("Connect attempt failed: {e:?}");
            }

            self.pump(PUMP_WINDOW).await;
            if self.connected {
                return Ok(());
            }

            match self.backoff.next_sleep() {
                Ok(delay) => {
                    info!(
                        "Retrying in {:.2} seconds (attempt {})",
                        delay.as_secs_f64(),
                        self.backoff.attempt()
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            info!("Connection attempt cancelled");
                            self.update_state(ConnectionState::Disconnected(
                                "Connection attempt cancelled".into(),
                            ));
                            return Err(TransferError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!("Giving up on broker connection: {e}");
                    self.update_state(ConnectionState::Failed(e.to_string()));
                    return Err(TransferError::RetriesPolicy(e));
                }
            }
        }
    }

    /// Publishes one message, reconnecting first when offline.
    ///
    /// A failed reconnect is returned as `RetriesPolicy`, which the worker
    /// treats as fatal. Any other error only concerns this message.
    pub async fn publish(
        &mut self,
        time_stamp: Option<i64>,
        qos: u8,
        retain: bool,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransferError> {
        if !self.connected {
            self.reconnect().await?;
        }

        debug!(
            "Publishing ({}) qos={qos} retain={retain} {topic}: {}",
            time_stamp.map(|ts| ts.to_string()).unwrap_or_else(|| "-".into()),
            String::from_utf8_lossy(&payload)
        );
        self.session.publish(topic, qos, retain, payload).await?;
        self.pump(PUMP_WINDOW).await;
        Ok(())
    }

    /// Services the network loop for `window` and dispatches what happened.
    pub async fn pump(&mut self, window: Duration) {
        for event in self.session.poll(window).await {
            self.handle_event(event).await;
        }
    }

    /// Sends DISCONNECT and processes the resulting events.
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.session.disconnect().await {
            warn!("Error sending disconnect packet: {}", get_error_message(&e));
        }
        self.pump(Duration::ZERO).await;
        self.connected = false;
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected {
                code,
                session_present,
            } => self.on_connect(code, session_present).await,
            SessionEvent::Disconnected {
                reason_code,
                reason,
            } => self.on_disconnect(reason_code, reason),
            SessionEvent::Published { packet_id } => self.on_publish(packet_id),
            SessionEvent::Log { message } => self.on_log(&message),
        }
    }

    async fn on_connect(&mut self, code: u8, session_present: bool) {
        info!(
            "Connected to broker ({}), return code {code}, session present {session_present}",
            self.session.protocol()
        );
        self.connected = true;
        self.update_state(ConnectionState::Connected);

        if let Some(lwt) = &self.lwt {
            let topic = lwt.topic.clone();
            let payload = lwt.online_payload.clone().into_bytes();
            if let Err(e) = self.session.publish(&topic, lwt.qos, lwt.retain, payload).await {
                warn!("Failed to publish presence to '{topic}': {}", get_error_message(&e));
            } else {
                debug!("Published presence '{}' to '{topic}'", lwt.online_payload);
            }
        }
    }

    fn on_disconnect(&mut self, reason_code: u8, reason: String) {
        self.connected = false;
        if reason_code == 0 {
            info!("Disconnected from broker");
        } else {
            error!("Unexpected disconnect from broker, code {reason_code}: {reason}");
        }
        self.update_state(ConnectionState::Disconnected(reason));
    }

    fn on_publish(&self, packet_id: u16) {
        debug!("Publish complete, packet id {packet_id}");
    }

    fn on_log(&self, message: &str) {
        debug!("MQTT log: {message}");
    }

    /// Broadcasts `state` if it differs from the current one.
    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            debug!("Connection state changed to: {state}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::session::scripted::{ScriptedSession, SessionLog};

    fn manager_with(
        script: impl IntoIterator<Item = bool>,
        config: &Config,
    ) -> (ConnectionManager, SessionLog, watch::Receiver<ConnectionState>) {
        let log = SessionLog::default();
        let session = ScriptedSession::new(script, log.clone());
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let mut backoff = Backoff::fixed(Duration::from_millis(1));
        backoff.set_max_attempts(config.max_retries);
        let manager =
            ConnectionManager::new(Box::new(session), config, Arc::new(state_tx)).with_backoff(backoff);
        (manager, log, state_rx)
    }

    #[tokio::test]
    async fn test_connect_succeeds_on_third_attempt() {
        let config = Config {
            max_retries: 5,
            ..Default::default()
        };
        let (mut manager, log, state_rx) = manager_with([false, false, true], &config);

        manager.connect().await.unwrap();

        assert_eq!(log.connects(), 3);
        assert!(manager.is_connected());
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_gives_up_after_max_retries() {
        let config = Config {
            max_retries: 2,
            ..Default::default()
        };
        let (mut manager, log, state_rx) = manager_with([false, false, false, true], &config);

        let result = manager.connect().await;

        assert!(matches!(result, Err(TransferError::RetriesPolicy(_))));
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(log.connects(), 3);
        assert!(!manager.is_connected());
        assert!(state_rx.borrow().is_failed());
        assert!(logs_contain("Failed to connect to broker: connection refused"));
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let config = Config {
            max_retries: 0,
            ..Default::default()
        };
        let (mut manager, log, _state_rx) = manager_with([false], &config);

        assert!(manager.connect().await.is_err());
        assert_eq!(log.connects(), 1);
    }

    #[tokio::test]
    async fn test_on_connect_publishes_online_presence() {
        let config = Config {
            lwt: Some(LwtConfig {
                topic: "weather/status".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (mut manager, log, _state_rx) = manager_with([], &config);

        manager.connect().await.unwrap();

        let published = log.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "weather/status");
        assert_eq!(published[0].payload, "online");
        assert!(published[0].retain);
    }

    #[tokio::test]
    async fn test_disabled_lwt_publishes_nothing_on_connect() {
        let config = Config {
            lwt: Some(LwtConfig {
                enable: false,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (mut manager, log, _state_rx) = manager_with([], &config);

        manager.connect().await.unwrap();
        assert!(log.published().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unexpected_disconnect_logs_error_and_clears_flag() {
        let (mut manager, log, state_rx) = manager_with([], &Config::default());
        manager.connect().await.unwrap();

        manager
            .handle_event(SessionEvent::Disconnected {
                reason_code: 7,
                reason: "connection reset".into(),
            })
            .await;

        assert!(!manager.is_connected());
        assert_eq!(log.reconnects(), 0);
        assert_eq!(
            *state_rx.borrow(),
            ConnectionState::Disconnected("connection reset".into())
        );
        assert!(logs_contain("Unexpected disconnect from broker, code 7"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_clean_disconnect_logs_info() {
        let (mut manager, log, _state_rx) = manager_with([], &Config::default());
        manager.connect().await.unwrap();

        manager.disconnect().await;

        assert_eq!(log.disconnects(), 1);
        assert!(!manager.is_connected());
        assert!(logs_contain("Disconnected from broker"));
        assert!(!logs_contain("Unexpected disconnect"));
    }

    #[tokio::test]
    async fn test_publish_reconnects_when_offline() {
        let (mut manager, log, _state_rx) = manager_with([true, false, true], &Config::default());
        manager.connect().await.unwrap();
        manager
            .handle_event(SessionEvent::Disconnected {
                reason_code: 7,
                reason: "gone".into(),
            })
            .await;

        manager
            .publish(Some(1_700_000_000), 1, false, "weather/loop", b"{}".to_vec())
            .await
            .unwrap();

        assert_eq!(log.connects(), 1);
        assert_eq!(log.reconnects(), 2);
        assert!(manager.is_connected());
        let published = log.published();
        assert_eq!(published.last().map(|m| m.topic.as_str()), Some("weather/loop"));
        assert_eq!(published.last().map(|m| m.qos), Some(1));
    }

    #[tokio::test]
    async fn test_publish_fails_fatally_when_reconnect_exhausted() {
        let config = Config {
            max_retries: 1,
            ..Default::default()
        };
        let (mut manager, log, _state_rx) = manager_with([false, false], &config);

        let result = manager
            .publish(None, 0, false, "weather/loop", b"{}".to_vec())
            .await;

        assert!(matches!(result, Err(TransferError::RetriesPolicy(_))));
        assert_eq!(log.reconnects(), 2);
        assert!(log.published().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_qos_is_not_fatal() {
        let (mut manager, _log, _state_rx) = manager_with([], &Config::default());
        manager.connect().await.unwrap();

        let result = manager.publish(None, 3, false, "weather/loop", Vec::new()).await;
        let err = result.unwrap_err();
        assert!(matches!(err, TransferError::InvalidQos(3)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_state_updates_only_on_change() {
        let (manager, _log, state_rx) = manager_with([], &Config::default());

        manager.update_state(ConnectionState::default());
        assert!(!state_rx.has_changed().unwrap());

        manager.update_state(ConnectionState::Connecting);
        assert!(state_rx.has_changed().unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_broker_log_events_are_logged() {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::default());
        let session = ScriptedSession::new([], SessionLog::default()).with_broker_log();
        let mut manager = ConnectionManager::new(Box::new(session), &Config::default(), Arc::new(state_tx));

        manager.connect().await.unwrap();
        manager
            .publish(None, 0, false, "weather/loop", b"{}".to_vec())
            .await
            .unwrap();

        assert!(logs_contain("MQTT log: Incoming(ConnAck)"));
        assert!(logs_contain("MQTT log: Outgoing(Publish(0))"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_wait() {
        let config = Config {
            max_retries: 5,
            ..Default::default()
        };
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let log = SessionLog::default();
        let session = ScriptedSession::new([false; 6], log.clone());
        let mut backoff = Backoff::fixed(Duration::from_secs(60));
        backoff.set_max_attempts(config.max_retries);
        let cancel = CancellationToken::new();
        let mut manager = ConnectionManager::new(Box::new(session), &config, Arc::new(state_tx))
            .with_backoff(backoff)
            .with_cancel(cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), manager.connect())
            .await
            .expect("connect should stop once cancelled");
        canceller.await.unwrap();

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(log.connects(), 1);
        assert!(!manager.is_connected());
        assert!(matches!(*state_rx.borrow(), ConnectionState::Disconnected(_)));
    }
}
