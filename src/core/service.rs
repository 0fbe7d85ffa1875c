//! The publish service: host-facing handlers and worker supervision.
//!
//! [`PublishService`] validates the configuration, builds the topic
//! registry and starts the dispatch worker. The host calls
//! [`PublishService::new_loop_packet`] and
//! [`PublishService::new_archive_record`]; both only enqueue and never wait
//! on the broker.
//!
//! Before every enqueue the service checks that the worker is still alive.
//! A dead worker is replaced up to `max_worker_restarts` times, and the
//! record that detected the failure is queued for the replacement. Beyond
//! that bound every handler call returns [`ServiceError::PublishingStopped`].

use std::{sync::Arc, time::Duration};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::watch,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wxbee_mqtt::{ConnectionState, RumqttcSessions, SessionFactory};

use super::{
    aggregate::{Aggregator, ArchiveAggregator},
    dispatch::{self, Inbox, PublishWorker, QueueHandle, WorkerContext, WorkerError},
    period::PeriodTable,
    record::{Envelope, Packet, RecordError, StreamKind},
    registry::{bindings, build_topics},
    transform::Transformer,
    units::{StandardUnits, UnitConverter},
};
use crate::config::{publish::PublishConfig, ConfigError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Publishing is not enabled")]
    Disabled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("The publish service needs a Tokio runtime: {0}")]
    Runtime(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("MQTT publishing thread has stopped.")]
    PublishingStopped,

    #[error("Dispatch queue is closed")]
    QueueClosed,
}

/// External capabilities the service is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionFactory>,
    pub converter: Arc<dyn UnitConverter>,
    pub aggregator: Arc<dyn Aggregator>,
    pub periods: PeriodTable,
}

impl Collaborators {
    /// rumqttc sessions, the standard unit tables, in-memory aggregation and
    /// the host's UTC offset.
    pub fn standard() -> Self {
        let converter: Arc<dyn UnitConverter> = Arc::new(StandardUnits::new());
        Self {
            sessions: Arc::new(RumqttcSessions),
            aggregator: Arc::new(ArchiveAggregator::new(converter.clone())),
            converter,
            periods: PeriodTable::local(),
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_periods(mut self, periods: PeriodTable) -> Self {
        self.periods = periods;
        self
    }
}

/// Owner of the dispatch queue and its worker.
pub struct PublishService {
    ctx: WorkerContext,
    queue: QueueHandle,
    inbox: Inbox,
    binding: Vec<StreamKind>,
    aggregator: Arc<dyn Aggregator>,
    runtime: Handle,
    cancel: CancellationToken,
    worker: Option<JoinHandle<Result<(), WorkerError>>>,
    restarts: u32,
    max_restarts: u32,
    shutdown_timeout: Duration,
    state_rx: watch::Receiver<ConnectionState>,
    stopped: bool,
}

impl PublishService {
    /// Validates `config` and starts the dispatch worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &PublishConfig, collaborators: Collaborators) -> Result<Self, ServiceError> {
        if !config.enable {
            return Err(ServiceError::Disabled);
        }
        let runtime = Handle::try_current().map_err(|e| ServiceError::Runtime(e.to_string()))?;

        let topics = build_topics(config)?;
        let binding = bindings(config.binding.as_ref())?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let ctx = WorkerContext {
            broker: Arc::new(config.broker.clone()),
            topics: Arc::new(topics),
            transformer: Arc::new(Transformer::new(
                collaborators.converter,
                collaborators.aggregator.clone(),
                collaborators.periods,
            )),
            sessions: collaborators.sessions,
            state: Arc::new(state_tx),
        };
        let (queue, inbox) = dispatch::queue();

        let mut service = Self {
            ctx,
            queue,
            inbox,
            binding,
            aggregator: collaborators.aggregator,
            runtime,
            cancel: CancellationToken::new(),
            worker: None,
            restarts: 0,
            max_restarts: config.max_worker_restarts,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout),
            state_rx,
            stopped: false,
        };
        service.spawn_worker();

        info!(
            "Publishing to {}:{} ({}), bound to {}",
            config.broker.host,
            config.broker.port,
            config.broker.protocol,
            service
                .binding
                .iter()
                .map(StreamKind::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(service)
    }

    /// Handles a live observation.
    pub fn new_loop_packet(&mut self, packet: Packet) -> Result<(), ServiceError> {
        self.handle(StreamKind::Live, packet)
    }

    /// Handles a summary (archive) record.
    pub fn new_archive_record(&mut self, record: Packet) -> Result<(), ServiceError> {
        self.handle(StreamKind::Summary, record)
    }

    fn handle(&mut self, kind: StreamKind, packet: Packet) -> Result<(), ServiceError> {
        if !self.binding.contains(&kind) {
            debug!("Ignoring {kind} record, service is not bound to it");
            return Ok(());
        }
        let envelope = Envelope::new(kind, packet)?;
        self.supervise()?;

        if kind == StreamKind::Summary {
            self.aggregator.observe(&envelope.packet);
        }
        self.queue
            .push(envelope)
            .map_err(|_| ServiceError::QueueClosed)
    }

    /// Replaces a dead worker while the restart budget lasts.
    fn supervise(&mut self) -> Result<(), ServiceError> {
        if self.stopped {
            return Err(ServiceError::PublishingStopped);
        }
        if self.is_running() {
            return Ok(());
        }

        if let Some(handle) = self.worker.take() {
            match handle.now_or_never() {
                Some(Ok(Ok(()))) => warn!("Publishing thread exited"),
                Some(Ok(Err(e))) => error!("Publishing thread ended: {e}"),
                Some(Err(e)) => error!("Publishing thread ended: {}", join_failure(e)),
                None => {}
            }
        }

        if self.restarts >= self.max_restarts {
            error!(
                "Publishing thread has stopped, {} restarts exhausted",
                self.max_restarts
            );
            self.stopped = true;
            return Err(ServiceError::PublishingStopped);
        }

        self.restarts += 1;
        warn!(
            "Restarting publishing thread ({}/{})",
            self.restarts, self.max_restarts
        );
        self.spawn_worker();
        Ok(())
    }

    fn spawn_worker(&mut self) {
        let worker = PublishWorker::new(self.ctx.clone(), self.inbox.clone(), self.cancel.clone());
        self.worker = Some(self.runtime.spawn(worker.run()));
    }

    /// Whether a worker task is alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Worker restarts so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Records accepted but not yet processed by the worker.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Waits until the worker has processed every accepted record.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.queue.drained(timeout).await
    }

    /// Receiver for broker connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stops the worker and waits up to `shutdown_timeout` for it.
    ///
    /// Records still queued are not published.
    pub async fn shutdown(mut self) {
        info!("Shutting down publisher");
        self.cancel.cancel();
        self.queue.wake();

        let Some(mut handle) = self.worker.take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => info!("Publishing thread joined"),
            Ok(Ok(Err(e))) => warn!("Publishing thread ended with error: {e}"),
            Ok(Err(e)) => warn!("Publishing thread ended: {}", join_failure(e)),
            Err(_) => {
                error!(
                    "Publishing thread did not stop within {} seconds",
                    self.shutdown_timeout.as_secs()
                );
                handle.abort();
            }
        }

        let left = self.queue.pending();
        if left > 0 {
            warn!("{left} records were not published");
        }
    }
}

fn join_failure(e: JoinError) -> WorkerError {
    if !e.is_panic() {
        return WorkerError::Aborted;
    }
    let panic = e.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    WorkerError::Panicked(message)
}
