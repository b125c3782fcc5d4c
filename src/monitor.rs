//! Inactivity monitor - consumer-facing API
//!
//! Wires feed connectors, per-feed coordinators and the shared alert sink
//! together behind a small surface for the presentation layer.

use crate::{
    alerts::{Alert, AlertSink, BroadcastObserver, DEFAULT_ALERT_CAP},
    connection::{ConnectorHandle, FeedConnector, FeedStatus},
    coordinator::{spawn_coordinator, MonitorEvent},
    data::{EngineConfig, FeedConfig, InstrumentConfig, InstrumentId, Tick},
    error::{ConfigError, MonitorError},
    events::AlertObserver,
    session::{MarketHours, SessionOracle},
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Default capacity of the tick and alert broadcast channels
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Default depth of a channel-only feed queue
const CHANNEL_FEED_CAPACITY: usize = 1024;

/// Builder for creating InactivityMonitor instances
pub struct InactivityMonitorBuilder {
    market: Arc<dyn MarketHours>,
    engine: EngineConfig,
    alert_cap: usize,
    broadcast_capacity: usize,
    observers: Vec<Arc<dyn AlertObserver>>,
}

impl InactivityMonitorBuilder {
    pub fn new() -> Self {
        Self {
            market: Arc::new(SessionOracle),
            engine: EngineConfig::default(),
            alert_cap: DEFAULT_ALERT_CAP,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            observers: Vec::new(),
        }
    }

    /// Replace the session calendar
    pub fn market_hours(mut self, market: Arc<dyn MarketHours>) -> Self {
        self.market = market;
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn alert_cap(mut self, cap: usize) -> Self {
        self.alert_cap = cap;
        self
    }

    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn AlertObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> InactivityMonitor {
        let sink = Arc::new(AlertSink::with_capacity(self.alert_cap));
        for observer in self.observers {
            sink.observers().register(observer);
        }

        let (alerts, _) = BroadcastObserver::new(self.broadcast_capacity);
        sink.observers().register(alerts.clone());
        let (ticks, _) = broadcast::channel(self.broadcast_capacity.max(1));

        InactivityMonitor {
            sink,
            market: self.market,
            engine: self.engine,
            ticks,
            alerts,
            feeds: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InactivityMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct FeedTask {
    queue: mpsc::Sender<MonitorEvent>,
    coordinator: JoinHandle<()>,
    connector: Option<ConnectorHandle>,
}

/// Main monitor interface
pub struct InactivityMonitor {
    sink: Arc<AlertSink>,
    market: Arc<dyn MarketHours>,
    engine: EngineConfig,
    ticks: broadcast::Sender<Tick>,
    alerts: Arc<BroadcastObserver>,
    feeds: Mutex<HashMap<String, FeedTask>>,
}

impl InactivityMonitor {
    pub fn builder() -> InactivityMonitorBuilder {
        InactivityMonitorBuilder::new()
    }

    /// Start ingesting a streaming feed. Must be called within a tokio runtime.
    pub fn add_feed(&self, config: FeedConfig) -> Result<(), MonitorError> {
        config.validate()?;
        self.ensure_unique(&config.name)?;

        let (queue, coordinator) = self.spawn_coordinator(&config.name, config.queue_capacity);
        let connector = FeedConnector::new(config.clone(), queue.clone()).spawn();

        tracing::info!("Added feed {} ({})", config.name, config.url);
        self.feeds().insert(
            config.name,
            FeedTask {
                queue,
                coordinator,
                connector: Some(connector),
            },
        );
        Ok(())
    }

    /// Register a feed whose events are pushed by the caller instead of a
    /// network connector. Returns the feed's queue.
    pub fn add_channel_feed(&self, name: &str) -> Result<mpsc::Sender<MonitorEvent>, MonitorError> {
        if name.is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "feed".to_string(),
                reason: "feed name is empty".to_string(),
            }
            .into());
        }
        self.ensure_unique(name)?;

        let (queue, coordinator) = self.spawn_coordinator(name, CHANNEL_FEED_CAPACITY);
        self.feeds().insert(
            name.to_string(),
            FeedTask {
                queue: queue.clone(),
                coordinator,
                connector: None,
            },
        );
        Ok(queue)
    }

    /// Replace an instrument's configuration and rebuild its monitors on
    /// every feed. An invalid configuration leaves the prior one in effect.
    pub async fn configure(&self, instrument: &str, config: InstrumentConfig) -> Result<(), ConfigError> {
        self.sink.set_config(instrument, config)?;

        for (name, queue) in self.queues() {
            if queue.send(MonitorEvent::Reconfigure(instrument.to_string())).await.is_err() {
                tracing::warn!("Feed {} is gone; skipping reconfigure of {}", name, instrument);
            }
        }
        Ok(())
    }

    fn queues(&self) -> Vec<(String, mpsc::Sender<MonitorEvent>)> {
        self.feeds()
            .iter()
            .map(|(name, task)| (name.clone(), task.queue.clone()))
            .collect()
    }

    pub fn config(&self, instrument: &str) -> Option<InstrumentConfig> {
        self.sink.config(instrument)
    }

    pub fn configs(&self) -> HashMap<InstrumentId, InstrumentConfig> {
        self.sink.configs()
    }

    /// Most-recent-first
    pub fn get_alerts(&self) -> Vec<Alert> {
        self.sink.alerts()
    }

    pub fn get_inactive_set(&self) -> HashSet<InstrumentId> {
        self.sink.inactive()
    }

    /// Drop every alert and the inactive set. Monitors that were flagged
    /// inactive start a fresh timer at their current baseline, so an
    /// instrument that stays flat is reported again.
    pub async fn clear_alerts(&self) {
        self.sink.clear_all();

        for (name, queue) in self.queues() {
            if queue.send(MonitorEvent::AlertsCleared).await.is_err() {
                tracing::warn!("Feed {} is gone; skipping re-arm after clear", name);
            }
        }
    }

    /// Live stream of every normalized tick across feeds
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<Tick> {
        self.ticks.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn AlertObserver>) -> u64 {
        self.sink.observers().register(observer)
    }

    pub fn unregister_observer(&self, id: u64) -> bool {
        self.sink.observers().unregister(id)
    }

    /// Connection health of a network feed
    pub fn feed_status(&self, name: &str) -> Option<FeedStatus> {
        self.feeds()
            .get(name)
            .and_then(|task| task.connector.as_ref())
            .map(ConnectorHandle::status)
    }

    pub fn feed_names(&self) -> Vec<String> {
        self.feeds().keys().cloned().collect()
    }

    /// Tear down every feed: connectors first, then coordinators with their timers
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, FeedTask)> = self.feeds().drain().collect();

        for (name, task) in tasks {
            if let Some(connector) = task.connector {
                connector.shutdown().await;
            }

            let _ = task.queue.send(MonitorEvent::Shutdown).await;
            if let Err(e) = task.coordinator.await {
                tracing::error!("Coordinator for {} ended abnormally: {}", name, e);
            }
        }

        tracing::info!("Inactivity monitor shut down");
    }

    fn spawn_coordinator(
        &self,
        feed: &str,
        capacity: usize,
    ) -> (mpsc::Sender<MonitorEvent>, JoinHandle<()>) {
        spawn_coordinator(
            feed,
            self.sink.clone(),
            self.market.clone(),
            self.engine.clone(),
            capacity,
            self.ticks.clone(),
        )
    }

    fn ensure_unique(&self, name: &str) -> Result<(), MonitorError> {
        if self.feeds().contains_key(name) {
            return Err(ConfigError::InvalidSetting {
                key: "feed".to_string(),
                reason: format!("feed {} already registered", name),
            }
            .into());
        }
        Ok(())
    }

    fn feeds(&self) -> MutexGuard<'_, HashMap<String, FeedTask>> {
        self.feeds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InactivityMonitor {
    fn default() -> Self {
        InactivityMonitorBuilder::new().build()
    }
}
