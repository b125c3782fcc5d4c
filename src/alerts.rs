//! Inactivity alerts and the alert sink
//!
//! The sink keeps a capped, most-recent-first alert log, the set of
//! currently inactive instruments and the live configuration map.
//! Inactivity is tracked per feed: an instrument stays in the inactive set
//! while any feed still reports it flat.

use crate::{
    data::{InstrumentConfig, InstrumentId, PriceRange},
    engine::MonitorState,
    error::ConfigError,
    events::{AlertObserver, ObserverRegistry},
    session::{MarketStatus, MarketType, SessionKind},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Default number of retained alerts
pub const DEFAULT_ALERT_CAP: usize = 100;

/// Emitted when an instrument's price has not moved for the configured duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub feed: String,
    pub instrument: InstrumentId,
    pub name: String,
    pub fired_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub deviation: Decimal,
    pub baseline: Decimal,
    /// Price of the latest tick when the timer fired
    pub price: Decimal,
    pub range: PriceRange,
    pub market_type: MarketType,
    pub session: SessionKind,
}

impl Alert {
    pub fn inactivity(
        feed: &str,
        state: &MonitorState,
        config: &InstrumentConfig,
        status: &MarketStatus,
        fired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            feed: feed.to_string(),
            instrument: state.instrument.clone(),
            name: state.name.clone(),
            fired_at,
            duration_secs: config.duration_secs,
            deviation: config.deviation,
            baseline: state.baseline,
            price: state.last_tick.last_price,
            range: state.price_range(),
            market_type: status.market_type,
            session: status.session,
        }
    }

    /// Format alert as a message string
    pub fn format_message(&self) -> String {
        format!(
            "⚠️ {} [{}] no move beyond ±{} for {}s: baseline {}, last {}, range {} ({} / {})",
            self.name,
            self.feed,
            self.deviation,
            self.duration_secs,
            self.baseline,
            self.price,
            self.range,
            self.market_type,
            self.session
        )
    }
}

/// Bounded alert log plus live inactive set and configuration map
pub struct AlertSink {
    alerts: Mutex<VecDeque<Alert>>,
    cap: usize,
    /// Instrument -> feeds on which it is inactive
    inactive: Mutex<HashMap<InstrumentId, HashSet<String>>>,
    configs: Mutex<HashMap<InstrumentId, InstrumentConfig>>,
    observers: ObserverRegistry,
}

impl AlertSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ALERT_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(cap)),
            cap: cap.max(1),
            inactive: Mutex::new(HashMap::new()),
            configs: Mutex::new(HashMap::new()),
            observers: ObserverRegistry::new(),
        }
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Prepend an alert, evicting the oldest past the cap
    pub fn record(&self, alert: Alert) {
        {
            let mut alerts = lock(&self.alerts);
            alerts.push_front(alert.clone());
            alerts.truncate(self.cap);
        }

        self.observers.dispatch_alert(&alert);
    }

    /// Flag `instrument` as inactive on `feed`. Returns true if the
    /// instrument was not inactive on any feed before.
    pub fn mark_inactive(&self, feed: &str, instrument: &str) -> bool {
        let mut inactive = lock(&self.inactive);
        let feeds = inactive.entry(instrument.to_string()).or_default();
        let newly = feeds.is_empty();
        feeds.insert(feed.to_string());
        newly
    }

    /// Drop `feed`'s inactive flag for `instrument`. Returns true if the
    /// instrument left the inactive set, i.e. no other feed still flags it.
    pub fn clear_inactive(&self, feed: &str, instrument: &str) -> bool {
        let left = {
            let mut inactive = lock(&self.inactive);
            match inactive.get_mut(instrument) {
                Some(feeds) => {
                    feeds.remove(feed);
                    if feeds.is_empty() {
                        inactive.remove(instrument);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if left {
            self.observers.dispatch_inactive_cleared(instrument);
        }
        left
    }

    /// Replace an instrument's configuration wholesale. On error the prior
    /// configuration stays in effect.
    pub fn set_config(
        &self,
        instrument: &str,
        config: InstrumentConfig,
    ) -> Result<Option<InstrumentConfig>, ConfigError> {
        config.validate()?;
        Ok(lock(&self.configs).insert(instrument.to_string(), config))
    }

    /// Drop all alerts and clear the inactive set. Configurations persist.
    /// Monitors flagged inactive have to be re-armed by their coordinators.
    pub fn clear_all(&self) {
        lock(&self.alerts).clear();

        let cleared: Vec<InstrumentId> = lock(&self.inactive).drain().map(|(id, _)| id).collect();
        for instrument in &cleared {
            self.observers.dispatch_inactive_cleared(instrument);
        }
    }

    pub fn config(&self, instrument: &str) -> Option<InstrumentConfig> {
        lock(&self.configs).get(instrument).cloned()
    }

    pub fn configs(&self) -> HashMap<InstrumentId, InstrumentConfig> {
        lock(&self.configs).clone()
    }

    /// Most-recent-first snapshot
    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).iter().cloned().collect()
    }

    /// Instruments inactive on at least one feed
    pub fn inactive(&self) -> HashSet<InstrumentId> {
        lock(&self.inactive).keys().cloned().collect()
    }

    pub fn is_inactive(&self, instrument: &str) -> bool {
        lock(&self.inactive).contains_key(instrument)
    }

    pub fn is_inactive_on(&self, feed: &str, instrument: &str) -> bool {
        lock(&self.inactive)
            .get(instrument)
            .map_or(false, |feeds| feeds.contains(feed))
    }
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Logs alerts through tracing
pub struct TracingObserver;

impl AlertObserver for TracingObserver {
    fn on_alert(&self, alert: &Alert) {
        tracing::warn!(target: "alerts", instrument = %alert.instrument, "[ALERT] {}", alert.format_message());
    }

    fn on_inactive_cleared(&self, instrument: &str) {
        tracing::info!(target: "alerts", "{} is moving again", instrument);
    }
}

/// Republishes alerts on a broadcast channel
pub struct BroadcastObserver {
    tx: broadcast::Sender<Alert>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> (Arc<Self>, broadcast::Receiver<Alert>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Arc::new(Self { tx }), rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }
}

impl AlertObserver for BroadcastObserver {
    fn on_alert(&self, alert: &Alert) {
        // No receivers is fine
        let _ = self.tx.send(alert.clone());
    }
}
