//! Event-stream feed connection management
//!
//! One [`FeedConnector`] per external feed. It keeps a single streaming
//! subscription open, turns inbound messages into normalized tick batches,
//! watches for frozen data and reconnects with exponential backoff. Every
//! timer it uses is a future owned by its task, so shutting the task down
//! drops them all.

use crate::{
    coordinator::MonitorEvent,
    data::{ConnectionState, FeedConfig, InstrumentId, ReconnectConfig, Tick},
    error::{ErrorReporter, ErrorSeverity, MonitorError, TransportError},
    parser::{PayloadParser, TickParser},
    sse::{SseDecoder, SseEvent},
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Retained diagnostics per feed
pub const DIAGNOSTICS_CAP: usize = 50;

/// Largest exponent applied to the base delay
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Reconnection strategy with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectStrategy {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectStrategy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// `min(base * 2^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
        std::cmp::min(self.config.base_delay.saturating_mul(factor), self.config.max_delay)
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        tracing::debug!("Exponential backoff: attempt {} waits {:?}", self.attempt, delay);
        delay
    }

    /// Number of failed attempts since the last successful open
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset reconnection strategy
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Last-seen bookkeeping per instrument
#[derive(Debug, Default)]
pub struct InstrumentTable {
    last_seen: HashMap<InstrumentId, DateTime<Utc>>,
    symbols: HashMap<InstrumentId, String>,
}

impl InstrumentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill in the inter-tick delay and back-fill a missing symbol.
    /// Redelivered stale timestamps yield a delay of 0.
    pub fn stamp(&mut self, mut tick: Tick) -> Tick {
        tick.delay_ms = match self.last_seen.get(&tick.instrument) {
            Some(previous) => (tick.exchange_timestamp - *previous)
                .num_milliseconds()
                .max(0) as u64,
            None => 0,
        };

        let latest = self
            .last_seen
            .get(&tick.instrument)
            .map_or(tick.exchange_timestamp, |previous| (*previous).max(tick.exchange_timestamp));
        self.last_seen.insert(tick.instrument.clone(), latest);

        match &tick.name {
            Some(name) => {
                self.symbols.insert(tick.instrument.clone(), name.clone());
            }
            None => tick.name = self.symbols.get(&tick.instrument).cloned(),
        }

        tick
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// Diagnostic category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    Connection,
    Parse,
    Freeze,
}

/// One recorded feed diagnostic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub at: DateTime<Utc>,
    pub kind: DiagnosticKind,
    pub severity: ErrorSeverity,
    pub message: String,
}

/// Snapshot of a feed's health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedStatus {
    pub feed: String,
    pub state: ConnectionState,
    pub frozen: bool,
    pub reconnect_attempts: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub messages_received: u64,
    pub ticks_emitted: u64,
    /// Most recent first
    pub diagnostics: VecDeque<Diagnostic>,
}

impl FeedStatus {
    pub fn new(feed: &str) -> Self {
        Self {
            feed: feed.to_string(),
            state: ConnectionState::Disconnected,
            frozen: false,
            reconnect_attempts: 0,
            last_message_at: None,
            messages_received: 0,
            ticks_emitted: 0,
            diagnostics: VecDeque::new(),
        }
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }

    fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push_front(diagnostic);
        self.diagnostics.truncate(DIAGNOSTICS_CAP);
    }
}

/// Shared, snapshot-readable feed status
#[derive(Debug, Clone)]
pub struct FeedStatusHandle(Arc<Mutex<FeedStatus>>);

impl FeedStatusHandle {
    pub fn new(feed: &str) -> Self {
        Self(Arc::new(Mutex::new(FeedStatus::new(feed))))
    }

    pub fn snapshot(&self) -> FeedStatus {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, FeedStatus> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum StreamEnd {
    Shutdown,
    Failed(TransportError),
}

/// Connection manager for one event-stream feed
pub struct FeedConnector {
    config: FeedConfig,
    client: reqwest::Client,
    parser: Arc<dyn PayloadParser>,
    status: FeedStatusHandle,
    table: InstrumentTable,
    strategy: ReconnectStrategy,
    events: mpsc::Sender<MonitorEvent>,
}

impl FeedConnector {
    pub fn new(config: FeedConfig, events: mpsc::Sender<MonitorEvent>) -> Self {
        Self::with_parser(config, events, Arc::new(TickParser::new()))
    }

    pub fn with_parser(
        config: FeedConfig,
        events: mpsc::Sender<MonitorEvent>,
        parser: Arc<dyn PayloadParser>,
    ) -> Self {
        Self {
            status: FeedStatusHandle::new(&config.name),
            strategy: ReconnectStrategy::new(config.reconnect.clone()),
            client: reqwest::Client::new(),
            table: InstrumentTable::new(),
            parser,
            config,
            events,
        }
    }

    pub fn status(&self) -> FeedStatusHandle {
        self.status.clone()
    }

    /// Run the connector on its own task
    pub fn spawn(self) -> ConnectorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = self.status();
        let join = tokio::spawn(self.run(shutdown_rx));

        ConnectorHandle {
            shutdown: shutdown_tx,
            join,
            status,
        }
    }

    /// Connect, stream, and reconnect until shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Starting feed {} at {}", self.config.name, self.config.url);

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let opened = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.open() => result,
            };

            let error = match opened {
                Ok(response) => {
                    self.on_open();
                    match self.read_stream(response, &mut shutdown).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.set_state(ConnectionState::Error);
            self.record(DiagnosticKind::Connection, MonitorError::Transport(error));

            let delay = self.strategy.next_delay();
            self.status.lock().reconnect_attempts = self.strategy.attempt();
            tracing::info!(
                "Feed {} reconnecting in {:?} (attempt {})",
                self.config.name,
                delay,
                self.strategy.attempt()
            );

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Feed {} stopped", self.config.name);
    }

    /// Open the subscription, bounded by the connection timeout
    async fn open(&self) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .client
            .get(&self.config.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");

        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = tokio::time::timeout(self.config.connect_timeout, request.send())
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "no response within {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::EstablishmentFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::BadStatus(response.status().as_u16()));
        }

        Ok(response)
    }

    fn on_open(&mut self) {
        self.strategy.reset();
        {
            let mut status = self.status.lock();
            status.reconnect_attempts = 0;
            status.frozen = false;
        }
        self.set_state(ConnectionState::Connected);
    }

    async fn read_stream(
        &mut self,
        response: reqwest::Response,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let idle = self.config.idle_timeout;

        let watchdog = sleep(idle);
        tokio::pin!(watchdog);
        let mut watchdog_armed = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return StreamEnd::Shutdown,
                _ = &mut watchdog, if watchdog_armed => {
                    watchdog_armed = false;
                    if self.on_freeze().await.is_err() {
                        return StreamEnd::Shutdown;
                    }
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let events = decoder.push(&bytes);
                        if let Some(error) = decoder.take_overflow() {
                            self.record(DiagnosticKind::Parse, MonitorError::Parse(error));
                        }
                        for event in events {
                            match self.handle_event(event).await {
                                Ok(true) => {
                                    watchdog.as_mut().reset(Instant::now() + idle);
                                    watchdog_armed = true;
                                }
                                Ok(false) => {}
                                Err(_) => return StreamEnd::Shutdown,
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return StreamEnd::Failed(TransportError::ConnectionLost(e.to_string()));
                    }
                    None => {
                        return StreamEnd::Failed(TransportError::ConnectionLost(
                            "stream closed by server".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Returns whether the event carried a well-formed batch
    async fn handle_event(&mut self, event: SseEvent) -> Result<bool, MonitorError> {
        let received_at = Utc::now();
        {
            let mut status = self.status.lock();
            status.messages_received += 1;
            status.last_message_at = Some(received_at);
        }

        let batch = match self.parser.parse_event(&event.event, &event.data) {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(false),
            Err(e) => {
                self.record(DiagnosticKind::Parse, MonitorError::Parse(e));
                return Ok(false);
            }
        };

        for error in batch.errors {
            self.record(DiagnosticKind::Parse, MonitorError::Parse(error));
        }

        let ticks: Vec<Tick> = batch
            .payloads
            .into_iter()
            .map(|payload| self.table.stamp(payload.normalize(received_at)))
            .collect();

        {
            let mut status = self.status.lock();
            if status.frozen {
                status.frozen = false;
                tracing::info!("Feed {} resumed after freeze", self.config.name);
            }
            status.ticks_emitted += ticks.len() as u64;
        }

        if !ticks.is_empty() {
            tracing::trace!("Feed {} delivering {} ticks", self.config.name, ticks.len());
            self.events
                .send(MonitorEvent::Ticks(ticks))
                .await
                .map_err(|_| MonitorError::ChannelClosed(self.config.name.clone()))?;
        }

        Ok(true)
    }

    async fn on_freeze(&mut self) -> Result<(), MonitorError> {
        let since = self.status.snapshot().last_message_at;
        self.status.lock().frozen = true;
        self.record(
            DiagnosticKind::Freeze,
            MonitorError::StaleData(format!(
                "no data for {:?} on feed {}",
                self.config.idle_timeout, self.config.name
            )),
        );

        self.events
            .send(MonitorEvent::Frozen { since })
            .await
            .map_err(|_| MonitorError::ChannelClosed(self.config.name.clone()))
    }

    fn record(&self, kind: DiagnosticKind, error: MonitorError) {
        let severity = ErrorReporter::report(&self.config.name, &error);
        self.status.lock().push_diagnostic(Diagnostic {
            at: Utc::now(),
            kind,
            severity,
            message: error.to_string(),
        });
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut self.status.lock().state, state);
        if previous != state {
            tracing::info!("Feed {}: {} -> {}", self.config.name, previous, state);
        }
    }
}

/// Handle to a running connector task
pub struct ConnectorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    status: FeedStatusHandle,
}

impl ConnectorHandle {
    pub fn status(&self) -> FeedStatus {
        self.status.snapshot()
    }

    /// Close the subscription and wait for the task to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::error!("Feed {} task ended abnormally: {}", self.status.snapshot().feed, e);
        }
    }
}
