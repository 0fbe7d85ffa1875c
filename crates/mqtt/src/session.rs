//! Broker sessions: one trait, two protocol generations.
//!
//! The 3.1.1 and 5.0 clients report connection events with different packet
//! shapes (return codes vs. reason codes, bare vs. property-carrying
//! DISCONNECT). Each session variant translates its own events into the
//! common [`SessionEvent`] so the Connection Manager implements the
//! connect/disconnect/publish/log handling exactly once.
//!
//! ```text
//! ConnectionManager ──(connect/reconnect/poll/publish)──▶ Box<dyn BrokerSession>
//!                   ◀──────────── SessionEvent ─────────── V4Session | V5Session
//! ```

use std::{collections::VecDeque, fmt, time::Duration};

use async_trait::async_trait;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use super::{
    client::{qos_v4, qos_v5, ClientBuilder},
    config::{Config, Protocol},
    error::TransferError,
};

/// Reason code reported for disconnects that were not requested by us.
pub const UNEXPECTED_DISCONNECT: u8 = 7;

/// Protocol-neutral notifications delivered while pumping a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The broker accepted the connection.
    Connected { code: u8, session_present: bool },

    /// The connection ended. `reason_code == 0` means a requested disconnect.
    Disconnected { reason_code: u8, reason: String },

    /// A publish left the client (QoS 0) or was acknowledged (QoS 1/2).
    Published { packet_id: u16 },

    /// Raw broker-library event, only produced when `log_mqtt` is set.
    Log { message: String },
}

/// One broker connection with a single owner.
///
/// Implementations never reconnect on their own: after a connection is lost
/// `poll` stays quiet until the owner calls `reconnect`.
#[async_trait]
pub trait BrokerSession: Send {
    /// Protocol spoken by this session.
    fn protocol(&self) -> Protocol;

    /// Performs the initial connection handshake.
    async fn connect(&mut self) -> Result<(), TransferError>;

    /// Re-establishes a lost connection reusing the original options.
    async fn reconnect(&mut self) -> Result<(), TransferError>;

    /// Services the network for at most `window` and returns what happened.
    async fn poll(&mut self, window: Duration) -> Vec<SessionEvent>;

    /// Submits a message without waiting for delivery.
    async fn publish(
        &mut self,
        topic: &str,
        qos: u8,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransferError>;

    /// Sends DISCONNECT and closes the connection.
    async fn disconnect(&mut self) -> Result<(), TransferError>;
}

/// Opens broker sessions. The dispatch worker calls this from its own task
/// so the session is owned by the worker that uses it.
pub trait SessionFactory: Send + Sync {
    fn open(&self, config: &Config) -> Result<Box<dyn BrokerSession>, TransferError>;
}

/// Factory for real `rumqttc` sessions, selected by the configured protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttcSessions;

impl SessionFactory for RumqttcSessions {
    fn open(&self, config: &Config) -> Result<Box<dyn BrokerSession>, TransferError> {
        open(config)
    }
}

/// Builds the session variant matching `config.protocol`.
pub fn open(config: &Config) -> Result<Box<dyn BrokerSession>, TransferError> {
    let builder = ClientBuilder::from_config(config)?;
    debug!(
        "Opening {} session to {}:{} as '{}'",
        config.protocol,
        config.host,
        config.port,
        builder.client_id()
    );

    match config.protocol {
        Protocol::V31 | Protocol::V311 => {
            if config.protocol == Protocol::V31 {
                warn!("MQTTv31 requested, connecting with MQTTv311");
            }
            let (client, event_loop) = builder.build_v4()?;
            Ok(Box::new(V4Session::new(client, event_loop, config)))
        }
        Protocol::V5 => {
            let (client, event_loop) = builder.build_v5()?;
            Ok(Box::new(V5Session::new(client, event_loop, config)))
        }
    }
}

/// Extracts the innermost error message from an error chain.
pub fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    let msg = current.to_string();
    msg.trim_matches('"').to_string()
}

/// Connection bookkeeping shared by both protocol generations.
#[derive(Debug)]
struct SessionCore {
    pending: VecDeque<SessionEvent>,
    online: bool,
    connect_timeout: u64,
    log_mqtt: bool,
}

impl SessionCore {
    fn new(config: &Config) -> Self {
        Self {
            pending: VecDeque::new(),
            online: false,
            connect_timeout: config.connect_timeout,
            log_mqtt: config.log_mqtt,
        }
    }

    fn log(&mut self, event: &impl fmt::Debug) {
        if self.log_mqtt {
            self.pending.push_back(SessionEvent::Log {
                message: format!("{event:?}"),
            });
        }
    }
}

/// The generation-specific half of a session: where events come from and
/// how they map onto [`SessionEvent`].
#[async_trait]
trait EventSource: Send {
    type Event: fmt::Debug + Send;
    type Error: std::error::Error + Send + Sync + 'static;

    fn core(&mut self) -> &mut SessionCore;

    async fn next_event(&mut self) -> Result<Self::Event, Self::Error>;

    /// Maps a client event, marking the session online or offline.
    fn translate(&mut self, event: Self::Event) -> Option<SessionEvent>;

    /// Reason code reported when the event loop fails with `err`.
    fn lost_code(err: &Self::Error) -> u8;
}

/// Polls until CONNACK or `connect_timeout`.
async fn run_handshake<S>(source: &mut S) -> Result<(), TransferError>
where
    S: EventSource,
    TransferError: From<S::Error>,
{
    let limit = source.core().connect_timeout;
    let outcome = timeout(Duration::from_secs(limit), async {
        loop {
            let event = source.next_event().await?;
            source.core().log(&event);
            if let Some(translated) = source.translate(event) {
                let connected = matches!(translated, SessionEvent::Connected { .. });
                source.core().pending.push_back(translated);
                if connected {
                    return Ok::<(), TransferError>(());
                }
            }
        }
    })
    .await;

    outcome.unwrap_or(Err(TransferError::ConnectTimeout(limit)))
}

/// Drains queued events, then services the network until `window` ends or
/// the connection is lost.
async fn poll_events<S: EventSource>(source: &mut S, window: Duration) -> Vec<SessionEvent> {
    let mut events: Vec<SessionEvent> = source.core().pending.drain(..).collect();
    if !source.core().online {
        return events;
    }

    let deadline = Instant::now() + window;
    loop {
        match timeout_at(deadline, source.next_event()).await {
            Err(_) => break,
            Ok(Ok(event)) => {
                source.core().log(&event);
                let translated = source.translate(event);
                events.extend(source.core().pending.drain(..));
                events.extend(translated);
            }
            Ok(Err(err)) => {
                let core = source.core();
                core.online = false;
                events.extend(core.pending.drain(..));
                events.push(SessionEvent::Disconnected {
                    reason_code: S::lost_code(&err),
                    reason: get_error_message(&err),
                });
                break;
            }
        }
    }
    events
}

/// Lets the event loop flush DISCONNECT, then records the clean close.
async fn finish_disconnect<S: EventSource>(source: &mut S) {
    let _ = timeout(Duration::from_secs(1), async {
        while source.next_event().await.is_ok() {}
    })
    .await;
    let core = source.core();
    core.online = false;
    core.pending.push_back(SessionEvent::Disconnected {
        reason_code: 0,
        reason: "Client disconnected".into(),
    });
}

/// MQTT 3.1 / 3.1.1 session.
pub struct V4Session {
    client: rumqttc::AsyncClient,
    event_loop: rumqttc::EventLoop,
    core: SessionCore,
    protocol: Protocol,
}

impl V4Session {
    pub fn new(client: rumqttc::AsyncClient, event_loop: rumqttc::EventLoop, config: &Config) -> Self {
        Self {
            client,
            event_loop,
            core: SessionCore::new(config),
            protocol: config.protocol,
        }
    }
}

#[async_trait]
impl EventSource for V4Session {
    type Event = rumqttc::Event;
    type Error = rumqttc::ConnectionError;

    fn core(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    async fn next_event(&mut self) -> Result<Self::Event, Self::Error> {
        self.event_loop.poll().await
    }

    fn translate(&mut self, event: rumqttc::Event) -> Option<SessionEvent> {
        use rumqttc::{Event, Outgoing, Packet};

        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.core.online = true;
                Some(SessionEvent::Connected {
                    code: ack.code as u8,
                    session_present: ack.session_present,
                })
            }
            Event::Incoming(Packet::Disconnect) => {
                self.core.online = false;
                Some(SessionEvent::Disconnected {
                    reason_code: UNEXPECTED_DISCONNECT,
                    reason: "Disconnected by broker".into(),
                })
            }
            Event::Incoming(Packet::PubAck(ack)) => Some(SessionEvent::Published { packet_id: ack.pkid }),
            Event::Incoming(Packet::PubComp(comp)) => {
                Some(SessionEvent::Published { packet_id: comp.pkid })
            }
            // QoS 0 publishes carry packet id 0 and are complete once written.
            Event::Outgoing(Outgoing::Publish(0)) => Some(SessionEvent::Published { packet_id: 0 }),
            _ => None,
        }
    }

    fn lost_code(err: &rumqttc::ConnectionError) -> u8 {
        match err {
            rumqttc::ConnectionError::ConnectionRefused(code) => *code as u8,
            _ => UNEXPECTED_DISCONNECT,
        }
    }
}

#[async_trait]
impl BrokerSession for V4Session {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn connect(&mut self) -> Result<(), TransferError> {
        run_handshake(self).await
    }

    async fn reconnect(&mut self) -> Result<(), TransferError> {
        // The event loop re-dials with its stored options on the next poll.
        run_handshake(self).await
    }

    async fn poll(&mut self, window: Duration) -> Vec<SessionEvent> {
        poll_events(self, window).await
    }

    async fn publish(
        &mut self,
        topic: &str,
        qos: u8,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransferError> {
        self.client.try_publish(topic, qos_v4(qos)?, retain, payload)?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransferError> {
        if !self.core.online {
            return Ok(());
        }
        self.client.try_disconnect()?;
        finish_disconnect(self).await;
        Ok(())
    }
}

/// MQTT 5 session.
pub struct V5Session {
    client: rumqttc::v5::AsyncClient,
    event_loop: rumqttc::v5::EventLoop,
    core: SessionCore,
}

impl V5Session {
    pub fn new(
        client: rumqttc::v5::AsyncClient,
        event_loop: rumqttc::v5::EventLoop,
        config: &Config,
    ) -> Self {
        Self {
            client,
            event_loop,
            core: SessionCore::new(config),
        }
    }
}

#[async_trait]
impl EventSource for V5Session {
    type Event = rumqttc::v5::Event;
    type Error = rumqttc::v5::ConnectionError;

    fn core(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    async fn next_event(&mut self) -> Result<Self::Event, Self::Error> {
        self.event_loop.poll().await
    }

    fn translate(&mut self, event: rumqttc::v5::Event) -> Option<SessionEvent> {
        use rumqttc::v5::{mqttbytes::v5::Packet, Event};

        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.core.online = true;
                Some(SessionEvent::Connected {
                    code: ack.code as u8,
                    session_present: ack.session_present,
                })
            }
            Event::Incoming(Packet::Disconnect(disconnect)) => {
                self.core.online = false;
                let reason_code = match disconnect.reason_code as u8 {
                    0 => UNEXPECTED_DISCONNECT,
                    code => code,
                };
                Some(SessionEvent::Disconnected {
                    reason_code,
                    reason: format!("Disconnected by broker: {:?}", disconnect.reason_code),
                })
            }
            Event::Incoming(Packet::PubAck(ack)) => Some(SessionEvent::Published { packet_id: ack.pkid }),
            Event::Incoming(Packet::PubComp(comp)) => {
                Some(SessionEvent::Published { packet_id: comp.pkid })
            }
            _ => None,
        }
    }

    fn lost_code(_err: &rumqttc::v5::ConnectionError) -> u8 {
        UNEXPECTED_DISCONNECT
    }
}

#[async_trait]
impl BrokerSession for V5Session {
    fn protocol(&self) -> Protocol {
        Protocol::V5
    }

    async fn connect(&mut self) -> Result<(), TransferError> {
        run_handshake(self).await
    }

    async fn reconnect(&mut self) -> Result<(), TransferError> {
        run_handshake(self).await
    }

    async fn poll(&mut self, window: Duration) -> Vec<SessionEvent> {
        poll_events(self, window).await
    }

    async fn publish(
        &mut self,
        topic: &str,
        qos: u8,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransferError> {
        self.client.try_publish(topic, qos_v5(qos)?, retain, payload)?;
        if qos == 0 {
            self.core.pending.push_back(SessionEvent::Published { packet_id: 0 });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransferError> {
        if !self.core.online {
            return Ok(());
        }
        self.client.try_disconnect()?;
        finish_disconnect(self).await;
        Ok(())
    }
}

/// Scripted in-memory session for tests.
///
/// Connect outcomes are taken from a script (an exhausted script means
/// success); every call and publish is recorded in a shared [`SessionLog`].
#[cfg(any(test, feature = "testing"))]
pub mod scripted {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A message handed to the scripted session.
    #[derive(Debug, Clone, PartialEq)]
    pub struct PublishedMessage {
        pub topic: String,
        pub qos: u8,
        pub retain: bool,
        pub payload: String,
    }

    #[derive(Debug, Default)]
    struct LogInner {
        opened: usize,
        connects: usize,
        reconnects: usize,
        disconnects: usize,
        published: Vec<PublishedMessage>,
    }

    /// Shared record of everything a scripted session did.
    #[derive(Debug, Default, Clone)]
    pub struct SessionLog(Arc<Mutex<LogInner>>);

    impl SessionLog {
        fn with<R>(&self, f: impl FnOnce(&mut LogInner) -> R) -> R {
            let mut inner = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut inner)
        }

        /// Sessions opened through the factory.
        pub fn opened(&self) -> usize {
            self.with(|l| l.opened)
        }

        /// Calls to `connect`.
        pub fn connects(&self) -> usize {
            self.with(|l| l.connects)
        }

        /// Calls to `reconnect`.
        pub fn reconnects(&self) -> usize {
            self.with(|l| l.reconnects)
        }

        /// Calls to `disconnect`.
        pub fn disconnects(&self) -> usize {
            self.with(|l| l.disconnects)
        }

        /// Every message published so far, in order.
        pub fn published(&self) -> Vec<PublishedMessage> {
            self.with(|l| l.published.clone())
        }
    }

    /// In-memory session driven by a connect script.
    pub struct ScriptedSession {
        log: SessionLog,
        script: Arc<Mutex<VecDeque<bool>>>,
        pending: VecDeque<SessionEvent>,
        online: bool,
        log_mqtt: bool,
    }

    impl ScriptedSession {
        /// `script[i]` decides whether the i-th connect/reconnect succeeds.
        pub fn new(script: impl IntoIterator<Item = bool>, log: SessionLog) -> Self {
            Self {
                log,
                script: Arc::new(Mutex::new(script.into_iter().collect())),
                pending: VecDeque::new(),
                online: false,
                log_mqtt: false,
            }
        }

        /// Emits a `SessionEvent::Log` per simulated client event, as real
        /// sessions do with `log_mqtt`.
        pub fn with_broker_log(mut self) -> Self {
            self.log_mqtt = true;
            self
        }

        fn broker_log(&mut self, message: &str) {
            if self.log_mqtt {
                self.pending.push_back(SessionEvent::Log {
                    message: message.to_string(),
                });
            }
        }

        fn attempt(&mut self) -> Result<(), TransferError> {
            let succeeds = self
                .script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front()
                .unwrap_or(true);
            if succeeds {
                self.online = true;
                self.broker_log("Incoming(ConnAck)");
                self.pending.push_back(SessionEvent::Connected {
                    code: 0,
                    session_present: false,
                });
                Ok(())
            } else {
                Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))
            }
        }
    }

    #[async_trait]
    impl BrokerSession for ScriptedSession {
        fn protocol(&self) -> Protocol {
            Protocol::V311
        }

        async fn connect(&mut self) -> Result<(), TransferError> {
            self.log.with(|l| l.connects += 1);
            self.attempt()
        }

        async fn reconnect(&mut self) -> Result<(), TransferError> {
            self.log.with(|l| l.reconnects += 1);
            self.attempt()
        }

        async fn poll(&mut self, _window: Duration) -> Vec<SessionEvent> {
            tokio::task::yield_now().await;
            self.pending.drain(..).collect()
        }

        async fn publish(
            &mut self,
            topic: &str,
            qos: u8,
            retain: bool,
            payload: Vec<u8>,
        ) -> Result<(), TransferError> {
            if qos > 2 {
                return Err(TransferError::InvalidQos(qos));
            }
            self.log.with(|l| {
                l.published.push(PublishedMessage {
                    topic: topic.to_string(),
                    qos,
                    retain,
                    payload: String::from_utf8_lossy(&payload).into_owned(),
                })
            });
            self.broker_log("Outgoing(Publish(0))");
            self.pending.push_back(SessionEvent::Published { packet_id: 0 });
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), TransferError> {
            self.log.with(|l| l.disconnects += 1);
            if self.online {
                self.online = false;
                self.pending.push_back(SessionEvent::Disconnected {
                    reason_code: 0,
                    reason: "Client disconnected".into(),
                });
            }
            Ok(())
        }
    }

    /// Factory handing out scripted sessions that share one log and one
    /// connect script, so a restarted worker continues the same script.
    #[derive(Clone)]
    pub struct ScriptedSessions {
        log: SessionLog,
        script: Arc<Mutex<VecDeque<bool>>>,
    }

    impl ScriptedSessions {
        pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
            Self {
                log: SessionLog::default(),
                script: Arc::new(Mutex::new(script.into_iter().collect())),
            }
        }

        /// Handle to the shared log.
        pub fn log(&self) -> SessionLog {
            self.log.clone()
        }
    }

    impl SessionFactory for ScriptedSessions {
        fn open(&self, config: &Config) -> Result<Box<dyn BrokerSession>, TransferError> {
            self.log.with(|l| l.opened += 1);
            Ok(Box::new(ScriptedSession {
                log: self.log.clone(),
                script: self.script.clone(),
                pending: VecDeque::new(),
                online: false,
                log_mqtt: config.log_mqtt,
            }))
        }
    }
}
