//! Per-feed single consumer
//!
//! Tick batches, freeze notices, timer expiries and reconfiguration requests
//! for one feed all travel through one ordered queue. The coordinator drains
//! it sequentially, runs the pure transition functions from [`crate::engine`]
//! and carries out the effects they return. A timer expiry that lost the race
//! against a re-arm arrives with an old generation and is ignored.

use crate::{
    alerts::AlertSink,
    data::{EngineConfig, InstrumentId, Tick},
    engine::{self, Effect, EvalContext, MonitorState, Transition},
    session::MarketHours,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{sleep, Instant};

/// Entry of a feed's ordered queue
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Ticks(Vec<Tick>),
    /// The feed went quiet; `since` is the last message time, if any
    Frozen { since: Option<DateTime<Utc>> },
    TimerFired { instrument: InstrumentId, generation: u64 },
    /// Configuration for the instrument changed; rebuild its monitor
    Reconfigure(InstrumentId),
    /// The alert log and inactive set were cleared; re-arm flat monitors
    AlertsCleared,
    Shutdown,
}

/// Wall clock derived from the tokio clock, so paused test time moves it too
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(origin_utc: DateTime<Utc>) -> Self {
        Self {
            origin_utc,
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

struct TimerSlot {
    generation: u64,
    handle: AbortHandle,
}

/// Owns every monitor of one feed
pub struct FeedCoordinator {
    feed: String,
    sink: Arc<AlertSink>,
    market: Arc<dyn MarketHours>,
    engine: EngineConfig,
    clock: MonotonicClock,
    states: HashMap<InstrumentId, MonitorState>,
    latest: HashMap<InstrumentId, Tick>,
    timers: HashMap<InstrumentId, TimerSlot>,
    queue: mpsc::Sender<MonitorEvent>,
    ticks_out: broadcast::Sender<Tick>,
}

impl FeedCoordinator {
    /// `queue` must feed the receiver later passed to [`FeedCoordinator::run`];
    /// timer expiries are posted through it.
    pub fn new(
        feed: &str,
        sink: Arc<AlertSink>,
        market: Arc<dyn MarketHours>,
        engine: EngineConfig,
        queue: mpsc::Sender<MonitorEvent>,
        ticks_out: broadcast::Sender<Tick>,
    ) -> Self {
        Self {
            feed: feed.to_string(),
            sink,
            market,
            engine,
            clock: MonotonicClock::new(),
            states: HashMap::new(),
            latest: HashMap::new(),
            timers: HashMap::new(),
            queue,
            ticks_out,
        }
    }

    pub fn with_clock(mut self, clock: MonotonicClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    pub fn state(&self, instrument: &str) -> Option<&MonitorState> {
        self.states.get(instrument)
    }

    pub fn monitored(&self) -> usize {
        self.states.len()
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    /// Drain the queue until shutdown, then cancel every pending timer
    pub async fn run(mut self, mut events: mpsc::Receiver<MonitorEvent>) {
        tracing::info!(feed = %self.feed, "Coordinator started");

        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                break;
            }
        }

        self.teardown();
        tracing::info!(feed = %self.feed, "Coordinator stopped");
    }

    /// Process one queue entry; returns false once shutdown was requested
    pub fn handle(&mut self, event: MonitorEvent) -> bool {
        match event {
            MonitorEvent::Ticks(ticks) => self.on_ticks(ticks),
            MonitorEvent::Frozen { since } => {
                tracing::warn!(
                    feed = %self.feed,
                    "Feed frozen (last message {:?}); {} monitors continue on last known prices",
                    since,
                    self.states.len()
                );
            }
            MonitorEvent::TimerFired { instrument, generation } => {
                self.on_timer_fired(&instrument, generation)
            }
            MonitorEvent::Reconfigure(instrument) => self.on_reconfigure(&instrument),
            MonitorEvent::AlertsCleared => self.on_alerts_cleared(),
            MonitorEvent::Shutdown => return false,
        }
        true
    }

    fn on_ticks(&mut self, ticks: Vec<Tick>) {
        for tick in &ticks {
            // No subscribers is fine
            let _ = self.ticks_out.send(tick.clone());
        }

        for tick in engine::dedupe_latest(ticks) {
            self.latest.insert(tick.instrument.clone(), tick.clone());

            let config = self.sink.config(&tick.instrument);
            let state = self.states.remove(&tick.instrument);
            let transition = {
                let ctx = self.context();
                engine::evaluate(&tick, config.as_ref(), state, &ctx)
            };
            self.apply(&tick.instrument, transition);
        }
    }

    fn on_timer_fired(&mut self, instrument: &str, generation: u64) {
        if self
            .timers
            .get(instrument)
            .map_or(false, |slot| slot.generation == generation)
        {
            self.timers.remove(instrument);
        }

        let config = self.sink.config(instrument);
        let state = self.states.remove(instrument);
        let transition = {
            let ctx = self.context();
            engine::on_timer_fired(generation, config.as_ref(), state, &ctx)
        };
        self.apply(instrument, transition);
    }

    fn on_reconfigure(&mut self, instrument: &str) {
        self.cancel_timer(instrument);
        self.states.remove(instrument);
        self.sink.clear_inactive(&self.feed, instrument);

        let tick = match self.latest.get(instrument) {
            Some(tick) => tick.clone(),
            None => return,
        };

        tracing::debug!(feed = %self.feed, "Rebuilding monitor for {} from price {}", instrument, tick.last_price);
        let config = self.sink.config(instrument);
        let transition = {
            let ctx = self.context();
            engine::evaluate(&tick, config.as_ref(), None, &ctx)
        };
        self.apply(instrument, transition);
    }

    fn on_alerts_cleared(&mut self) {
        let flagged: Vec<InstrumentId> = self
            .states
            .iter()
            .filter(|(_, state)| state.inactive)
            .map(|(id, _)| id.clone())
            .collect();

        for instrument in flagged {
            let config = self.sink.config(&instrument);
            let state = match self.states.remove(&instrument) {
                Some(state) => state,
                None => continue,
            };
            let transition = {
                let ctx = self.context();
                engine::rearm_after_clear(config.as_ref(), state, &ctx)
            };
            self.apply(&instrument, transition);
        }
    }

    fn context(&self) -> EvalContext<'_> {
        EvalContext {
            feed: &self.feed,
            market: self.market.as_ref(),
            engine: &self.engine,
            now: self.clock.now(),
        }
    }

    fn apply(&mut self, instrument: &str, transition: Transition) {
        match transition.state {
            Some(state) => {
                self.states.insert(instrument.to_string(), state);
            }
            None => {
                self.cancel_timer(instrument);
            }
        }

        for effect in transition.effects {
            match effect {
                Effect::ArmTimer {
                    instrument,
                    generation,
                    after,
                } => self.arm_timer(instrument, generation, after),
                Effect::CancelTimer { instrument } => self.cancel_timer(&instrument),
                Effect::EmitAlert(alert) => self.sink.record(alert),
                Effect::MarkInactive(instrument) => {
                    self.sink.mark_inactive(&self.feed, &instrument);
                }
                Effect::ClearInactive(instrument) => {
                    self.sink.clear_inactive(&self.feed, &instrument);
                }
            }
        }
    }

    fn arm_timer(&mut self, instrument: InstrumentId, generation: u64, after: Duration) {
        self.cancel_timer(&instrument);

        let queue = self.queue.clone();
        let fired = MonitorEvent::TimerFired {
            instrument: instrument.clone(),
            generation,
        };
        let task = tokio::spawn(async move {
            sleep(after).await;
            let _ = queue.send(fired).await;
        });

        self.timers.insert(
            instrument,
            TimerSlot {
                generation,
                handle: task.abort_handle(),
            },
        );
    }

    fn cancel_timer(&mut self, instrument: &str) {
        if let Some(slot) = self.timers.remove(instrument) {
            slot.handle.abort();
        }
    }

    fn teardown(&mut self) {
        for (_, slot) in self.timers.drain() {
            slot.handle.abort();
        }
        self.states.clear();
    }
}

/// Spawn a coordinator on its own task with a fresh queue
pub fn spawn_coordinator(
    feed: &str,
    sink: Arc<AlertSink>,
    market: Arc<dyn MarketHours>,
    engine: EngineConfig,
    capacity: usize,
    ticks_out: broadcast::Sender<Tick>,
) -> (mpsc::Sender<MonitorEvent>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let coordinator = FeedCoordinator::new(feed, sink, market, engine, tx.clone(), ticks_out);
    let join = tokio::spawn(coordinator.run(rx));
    (tx, join)
}
