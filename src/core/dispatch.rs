//! Dispatch queue and the publishing worker.
//!
//! Producers push [`Envelope`]s through a [`QueueHandle`]. A single
//! [`PublishWorker`] drains the queue in FIFO order, transforms each record
//! for every topic bound to its stream and publishes the result through its
//! own [`ConnectionManager`]. The broker session is opened inside the
//! worker's task and never leaves it.
//!
//! When the queue is empty the worker services the network loop and then
//! sleeps until it is woken by a producer, cancelled, or a quarter of the
//! keepalive interval elapses.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::SendError, error::TryRecvError, UnboundedReceiver, UnboundedSender},
        watch, Mutex, Notify,
    },
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use wxbee_mqtt::{
    connection::PUMP_WINDOW, ConnectionManager, ConnectionState, SessionFactory, TransferError,
};

use super::{
    record::{Envelope, Packet},
    registry::{PayloadKind, Topics},
    transform::Transformer,
};

/// Terminal failure of a worker. The owner decides whether to restart.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Broker connection lost: {0}")]
    Connection(#[from] TransferError),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Worker was aborted")]
    Aborted,
}

#[derive(Debug, Default)]
struct Signals {
    /// Raised by producers after every push.
    wake: Notify,
    /// Raised by the worker when the queue has been fully processed.
    drained: Notify,
    /// Records pushed but not yet processed.
    pending: AtomicUsize,
}

/// Producer side of the dispatch queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: UnboundedSender<Envelope>,
    signals: Arc<Signals>,
}

/// Consumer side of the dispatch queue. Only one worker holds it at a time.
#[derive(Debug, Clone)]
pub struct Inbox {
    rx: Arc<Mutex<UnboundedReceiver<Envelope>>>,
    signals: Arc<Signals>,
}

/// Creates an unbounded dispatch queue.
pub fn queue() -> (QueueHandle, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let signals = Arc::new(Signals::default());
    (
        QueueHandle {
            tx,
            signals: signals.clone(),
        },
        Inbox {
            rx: Arc::new(Mutex::new(rx)),
            signals,
        },
    )
}

impl QueueHandle {
    /// Enqueues `envelope` and wakes the worker. Never blocks.
    pub fn push(&self, envelope: Envelope) -> Result<(), SendError<Envelope>> {
        self.signals.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(envelope) {
            self.signals.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        self.signals.wake.notify_one();
        Ok(())
    }

    /// Wakes the worker without enqueuing anything.
    pub fn wake(&self) {
        self.signals.wake.notify_one();
    }

    /// Records pushed but not yet processed.
    pub fn pending(&self) -> usize {
        self.signals.pending.load(Ordering::SeqCst)
    }

    /// Waits until every pushed record has been processed.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.signals.drained.notified();
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending() == 0;
            }
        }
    }
}

impl Inbox {
    /// Marks one record processed when the returned guard drops, including
    /// on panic.
    fn processing(&self) -> Processing<'_> {
        Processing(&self.signals)
    }
}

struct Processing<'a>(&'a Signals);

impl Drop for Processing<'_> {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// Everything a worker needs, shared with its successors.
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Arc<wxbee_mqtt::Config>,
    pub topics: Arc<Topics>,
    pub transformer: Arc<Transformer>,
    pub sessions: Arc<dyn SessionFactory>,
    pub state: Arc<watch::Sender<ConnectionState>>,
}

/// The single consumer of the dispatch queue.
pub struct PublishWorker {
    ctx: WorkerContext,
    inbox: Inbox,
    cancel: CancellationToken,
}

impl PublishWorker {
    pub fn new(ctx: WorkerContext, inbox: Inbox, cancel: CancellationToken) -> Self {
        Self { ctx, inbox, cancel }
    }

    /// Runs until cancelled or until the broker connection cannot be
    /// re-established.
    #[instrument(name = "publish_worker", skip(self))]
    pub async fn run(self) -> Result<(), WorkerError> {
        let mut queue = self.inbox.rx.clone().lock_owned().await;

        let session = self.ctx.sessions.open(&self.ctx.broker)?;
        let mut connection = ConnectionManager::new(session, &self.ctx.broker, self.ctx.state.clone())
            .with_cancel(self.cancel.clone());
        if let Err(e) = connection.connect().await {
            if self.cancel.is_cancelled() {
                info!("Publishing thread stopped before connecting");
                return Ok(());
            }
            return Err(e.into());
        }

        let idle = Duration::from_secs(self.ctx.broker.keepalive) / 4;
        info!("Publishing thread started");

        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            match queue.try_recv() {
                Ok(envelope) => {
                    let _processing = self.inbox.processing();
                    match self.dispatch(&mut connection, &envelope).await {
                        Err(_) if self.cancel.is_cancelled() => break Ok(()),
                        Err(e) => break Err(e),
                        Ok(()) => {}
                    }
                }
                Err(TryRecvError::Empty) => {
                    connection.pump(PUMP_WINDOW).await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = self.inbox.signals.wake.notified() => {}
                        _ = sleep(idle) => {}
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    debug!("Dispatch queue closed");
                    break Ok(());
                }
            }
        };

        connection.disconnect().await;
        match &result {
            Ok(()) => info!("Publishing thread stopped"),
            Err(e) => error!("Publishing thread failed: {e}"),
        }
        result
    }

    async fn dispatch(
        &self,
        connection: &mut ConnectionManager,
        envelope: &Envelope,
    ) -> Result<(), WorkerError> {
        debug!("Processing {} record {}", envelope.kind, envelope.time_stamp);

        for (name, topic) in self.ctx.topics.for_kind(envelope.kind) {
            let record = match self.ctx.transformer.transform(topic, &envelope.packet) {
                Ok(record) => record,
                Err(e) => {
                    error!("Record {} not published: {e}", envelope.time_stamp);
                    continue;
                }
            };
            let messages = match shape(name, topic.kind, &record) {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Topic '{name}': cannot serialize record {}: {e}", envelope.time_stamp);
                    continue;
                }
            };

            for (topic_name, payload) in messages {
                if let Err(e) = connection
                    .publish(
                        Some(envelope.time_stamp),
                        topic.qos,
                        topic.retain,
                        &topic_name,
                        payload,
                    )
                    .await
                {
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    warn!("Failed to publish to '{topic_name}': {e}");
                }
            }
        }
        Ok(())
    }
}

/// Shapes a transformed record into `(topic, payload)` messages.
pub fn shape(
    topic: &str,
    kind: PayloadKind,
    record: &Packet,
) -> Result<Vec<(String, Vec<u8>)>, serde_json::Error> {
    Ok(match kind {
        PayloadKind::Structured => vec![(topic.to_string(), serde_json::to_vec(record)?)],
        PayloadKind::Delimited => {
            let text = record
                .iter()
                .map(|(key, value)| format!("{key}={}", text_of(value)))
                .collect::<Vec<_>>()
                .join(", ");
            vec![(topic.to_string(), text.into_bytes())]
        }
        PayloadKind::PerField => record
            .iter()
            .map(|(key, value)| {
                let payload = match value {
                    serde_json::Value::Null => Vec::new(),
                    other => text_of(other).into_bytes(),
                };
                (format!("{topic}/{key}"), payload)
            })
            .collect(),
    })
}

fn text_of(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinHandle;
    use wxbee_mqtt::session::scripted::ScriptedSessions;

    use super::*;
    use crate::{
        config::publish::PublishConfig,
        core::{
            aggregate::ArchiveAggregator, period::PeriodTable, record::StreamKind,
            registry::build_topics, units::StandardUnits,
        },
    };

    fn record(text: &str) -> Packet {
        serde_json::from_str(text).unwrap()
    }

    fn context(topics: &str, sessions: &ScriptedSessions) -> WorkerContext {
        let config: PublishConfig = toml::from_str(topics).unwrap();
        let units = Arc::new(StandardUnits::new());
        let aggregator = Arc::new(ArchiveAggregator::new(units.clone()));
        let (state, _) = watch::channel(ConnectionState::default());
        WorkerContext {
            broker: Arc::new(config.broker.clone()),
            topics: Arc::new(build_topics(&config).unwrap()),
            transformer: Arc::new(Transformer::new(units, aggregator, PeriodTable::utc())),
            sessions: Arc::new(sessions.clone()),
            state: Arc::new(state),
        }
    }

    fn spawn(ctx: WorkerContext) -> (QueueHandle, CancellationToken, JoinHandle<Result<(), WorkerError>>) {
        let (handle, inbox) = queue();
        let cancel = CancellationToken::new();
        let worker = PublishWorker::new(ctx, inbox, cancel.clone());
        (handle, cancel, tokio::spawn(worker.run()))
    }

    fn envelope(kind: StreamKind, text: &str) -> Envelope {
        Envelope::new(kind, record(text)).unwrap()
    }

    #[test]
    fn test_shape_structured() {
        let packet = record(r#"{"dateTime": "1700000000", "outTemp_F": "72.5"}"#);
        let messages = shape("weather", PayloadKind::Structured, &packet).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "weather");
        assert_eq!(
            String::from_utf8(messages[0].1.clone()).unwrap(),
            r#"{"dateTime":"1700000000","outTemp_F":"72.5"}"#
        );
    }

    #[test]
    fn test_shape_delimited() {
        let packet = record(r#"{"outTemp_F": "72.5", "windDir": 180, "rain_in": null}"#);
        let messages = shape("weather", PayloadKind::Delimited, &packet).unwrap();
        assert_eq!(
            String::from_utf8(messages[0].1.clone()).unwrap(),
            "outTemp_F=72.5, windDir=180, rain_in=None"
        );
    }

    #[test]
    fn test_shape_per_field() {
        let packet = record(r#"{"outTemp_F": "72.5", "rain_in": null}"#);
        let messages = shape("weather", PayloadKind::PerField, &packet).unwrap();
        assert_eq!(
            messages,
            vec![
                ("weather/outTemp_F".to_string(), b"72.5".to_vec()),
                ("weather/rain_in".to_string(), Vec::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_queue_tracks_pending_records() {
        let (handle, inbox) = queue();
        handle
            .push(envelope(StreamKind::Live, r#"{"dateTime": 1}"#))
            .unwrap();
        assert_eq!(handle.pending(), 1);
        assert!(!handle.drained(Duration::from_millis(10)).await);

        drop(inbox.processing());
        assert!(handle.drained(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_panicking_dispatch_still_counts_record_done() {
        let (handle, inbox) = queue();
        handle
            .push(envelope(StreamKind::Live, r#"{"dateTime": 1}"#))
            .unwrap();

        let worker = tokio::spawn(async move {
            let _processing = inbox.processing();
            panic!("dispatch failed");
        });
        assert!(worker.await.unwrap_err().is_panic());

        assert_eq!(handle.pending(), 0);
        assert!(handle.drained(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_cancel_stops_worker_waiting_to_reconnect() {
        let sessions = ScriptedSessions::new([false; 5]);
        let ctx = context(
            r#"
            max_retries = 5
            retry_delay = 30
            [topics."test/loop"]
            "#,
            &sessions,
        );
        let (_handle, cancel, worker) = spawn(ctx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(sessions.log().connects(), 1);
    }

    #[tokio::test]
    async fn test_worker_publishes_in_order() {
        let sessions = ScriptedSessions::new([true]);
        let ctx = context(
            r#"
            [topics."test/loop"]
            binding = "loop"
            [topics."test/archive"]
            binding = "archive"
            type = "keyword"
            [topics."test/archive".fields.dateTime]
            ignore = true
            [topics."test/archive".fields.usUnits]
            ignore = true
            "#,
            &sessions,
        );
        let (handle, cancel, worker) = spawn(ctx);

        handle
            .push(envelope(
                StreamKind::Live,
                r#"{"dateTime": 1700000000, "usUnits": 1, "outTemp": 72.5}"#,
            ))
            .unwrap();
        handle
            .push(envelope(
                StreamKind::Summary,
                r#"{"dateTime": 1700000300, "usUnits": 1, "outTemp": 73.0, "windDir": 90}"#,
            ))
            .unwrap();
        assert!(handle.drained(Duration::from_secs(5)).await);

        cancel.cancel();
        worker.await.unwrap().unwrap();

        let log = sessions.log();
        let published = log.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "test/loop");
        let json: serde_json::Value = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(json["outTemp_F"], "72.5");
        assert_eq!(published[1].topic, "test/archive");
        assert_eq!(published[1].payload, "outTemp_F=73.0, windDir=90");
        assert_eq!(log.connects(), 1);
        assert_eq!(log.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_worker_fails_when_connect_gives_up() {
        let sessions = ScriptedSessions::new([false, false, false]);
        let ctx = context(
            r#"
            max_retries = 0
            [topics."test/loop"]
            "#,
            &sessions,
        );
        let (_handle, _cancel, worker) = spawn(ctx.clone());

        let result = worker.await.unwrap();
        assert!(matches!(result, Err(WorkerError::Connection(ref e)) if e.is_fatal()));
        assert_eq!(sessions.log().connects(), 1);
        assert!(ctx.state.borrow().is_failed());
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_worker() {
        let sessions = ScriptedSessions::new([true]);
        let ctx = context(r#"[topics."test/loop"]"#, &sessions);
        let (_handle, cancel, worker) = spawn(ctx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sessions.log().disconnects(), 1);
    }
}
