//! Per-instrument inactivity state machine
//!
//! `evaluate` and `on_timer_fired` are pure: they take the current monitor
//! state by value and return the next state plus the side effects the
//! coordinator has to carry out. Timers are identified by a generation
//! number that increases on every arm, so a fire event that lost a race
//! against a re-arm is recognised as stale and ignored.

use crate::{
    alerts::Alert,
    data::{EngineConfig, InstrumentConfig, InstrumentId, PricePoint, PriceRange, Tick},
    session::MarketHours,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// A duration timer that has been started and not yet fired or cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub generation: u64,
    pub armed_at: DateTime<Utc>,
}

/// Monitoring state of one instrument on one feed
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorState {
    pub instrument: InstrumentId,
    pub name: String,
    /// Price considered "no movement"
    pub baseline: Decimal,
    pub history: VecDeque<PricePoint>,
    pub timer: Option<ArmedTimer>,
    /// Generation of the most recently armed timer
    pub generation: u64,
    pub last_status_check: DateTime<Utc>,
    pub market_open: bool,
    pub last_tick: Tick,
    /// An alert fired for the current episode and no movement followed yet
    pub inactive: bool,
}

impl MonitorState {
    fn new(tick: &Tick, market_open: bool, now: DateTime<Utc>) -> Self {
        let mut history = VecDeque::new();
        history.push_back(PricePoint {
            price: tick.last_price,
            timestamp: now,
        });

        Self {
            instrument: tick.instrument.clone(),
            name: tick.display_name().to_string(),
            baseline: tick.last_price,
            history,
            timer: None,
            generation: 0,
            last_status_check: now,
            market_open,
            last_tick: tick.clone(),
            inactive: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Min/max of the retained history
    pub fn price_range(&self) -> PriceRange {
        let seed = self
            .history
            .front()
            .map(|p| p.price)
            .unwrap_or(self.last_tick.last_price);

        self.history.iter().fold(
            PriceRange { min: seed, max: seed },
            |range, point| PriceRange {
                min: range.min.min(point.price),
                max: range.max.max(point.price),
            },
        )
    }

    /// Start a fresh timer, superseding any armed one
    fn arm(&mut self, config: &InstrumentConfig, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        self.generation += 1;
        self.timer = Some(ArmedTimer {
            generation: self.generation,
            armed_at: now,
        });
        effects.push(Effect::ArmTimer {
            instrument: self.instrument.clone(),
            generation: self.generation,
            after: config.duration(),
        });
    }

    fn disarm(&mut self, effects: &mut Vec<Effect>) {
        if self.timer.take().is_some() {
            effects.push(Effect::CancelTimer {
                instrument: self.instrument.clone(),
            });
        }
    }

    fn clear_inactive(&mut self, effects: &mut Vec<Effect>) {
        if self.inactive {
            self.inactive = false;
            effects.push(Effect::ClearInactive(self.instrument.clone()));
        }
    }

    fn reset_history(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.history.clear();
        self.history.push_back(PricePoint { price, timestamp: now });
    }

    fn record_price(&mut self, price: Decimal, engine: &EngineConfig, now: DateTime<Utc>) {
        self.history.push_back(PricePoint { price, timestamp: now });

        if let Ok(retention) = chrono::Duration::from_std(engine.history_retention) {
            let cutoff = now - retention;
            while self.history.len() > 1 && self.history.front().map_or(false, |p| p.timestamp < cutoff) {
                self.history.pop_front();
            }
        }

        while self.history.len() > engine.history_cap.max(1) {
            self.history.pop_front();
        }
    }
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start a timer; replaces any timer already running for the instrument
    ArmTimer {
        instrument: InstrumentId,
        generation: u64,
        after: Duration,
    },
    CancelTimer {
        instrument: InstrumentId,
    },
    EmitAlert(Alert),
    MarkInactive(InstrumentId),
    ClearInactive(InstrumentId),
}

/// Next state (None = destroyed/absent) and the effects to apply
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: Option<MonitorState>,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn new(state: Option<MonitorState>, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }
}

/// Inputs shared by every transition of one feed
pub struct EvalContext<'a> {
    pub feed: &'a str,
    pub market: &'a dyn MarketHours,
    pub engine: &'a EngineConfig,
    pub now: DateTime<Utc>,
}

impl EvalContext<'_> {
    fn market_open(&self, config: &InstrumentConfig, name: &str) -> bool {
        !config.respect_market_hours || self.market.is_open(name, self.now)
    }
}

fn enabled(config: Option<&InstrumentConfig>) -> Option<&InstrumentConfig> {
    config.filter(|c| c.enabled)
}

/// Apply one tick to one instrument's monitor
pub fn evaluate(
    tick: &Tick,
    config: Option<&InstrumentConfig>,
    state: Option<MonitorState>,
    ctx: &EvalContext<'_>,
) -> Transition {
    let mut effects = Vec::new();
    let now = ctx.now;

    let config = match enabled(config) {
        Some(config) => config,
        None => {
            if let Some(mut state) = state {
                state.disarm(&mut effects);
            }
            effects.push(Effect::ClearInactive(tick.instrument.clone()));
            return Transition::new(None, effects);
        }
    };

    let mut state = match state {
        Some(state) => state,
        None => {
            let market_open = ctx.market_open(config, tick.display_name());
            let mut state = MonitorState::new(tick, market_open, now);
            if market_open {
                state.arm(config, now, &mut effects);
            }
            tracing::debug!(
                feed = ctx.feed,
                "Monitoring {} from baseline {} (market open: {})",
                state.name,
                state.baseline,
                market_open
            );
            return Transition::new(Some(state), effects);
        }
    };

    if let Some(name) = &tick.name {
        state.name = name.clone();
    }
    state.last_tick = tick.clone();

    let check_due = chrono::Duration::from_std(ctx.engine.status_check_interval)
        .map(|interval| now - state.last_status_check >= interval)
        .unwrap_or(true);

    if check_due {
        state.last_status_check = now;
        let open = ctx.market_open(config, &state.name);

        if open != state.market_open {
            state.market_open = open;

            if open {
                tracing::info!(feed = ctx.feed, "Market opened for {}, resetting baseline to {}", state.name, tick.last_price);
                state.baseline = tick.last_price;
                state.reset_history(tick.last_price, now);
                state.arm(config, now, &mut effects);
                state.clear_inactive(&mut effects);
            } else {
                tracing::info!(feed = ctx.feed, "Market closed for {}, pausing monitor", state.name);
                state.disarm(&mut effects);
            }

            return Transition::new(Some(state), effects);
        }
    }

    if config.respect_market_hours && !state.market_open {
        state.disarm(&mut effects);
        return Transition::new(Some(state), effects);
    }

    state.record_price(tick.last_price, ctx.engine, now);

    if (tick.last_price - state.baseline).abs() > config.deviation {
        tracing::debug!(
            feed = ctx.feed,
            "{} moved {} -> {}, restarting timer",
            state.name,
            state.baseline,
            tick.last_price
        );
        state.baseline = tick.last_price;
        state.arm(config, now, &mut effects);
        state.clear_inactive(&mut effects);
    }

    Transition::new(Some(state), effects)
}

/// Handle expiry of the timer tagged `generation`
pub fn on_timer_fired(
    generation: u64,
    config: Option<&InstrumentConfig>,
    state: Option<MonitorState>,
    ctx: &EvalContext<'_>,
) -> Transition {
    let mut state = match state {
        Some(state) => state,
        None => return Transition::new(None, Vec::new()),
    };

    match state.timer {
        Some(timer) if timer.generation == generation => {}
        _ => {
            tracing::trace!(feed = ctx.feed, "Ignoring stale timer {} for {}", generation, state.name);
            return Transition::new(Some(state), Vec::new());
        }
    }
    state.timer = None;

    let config = match enabled(config) {
        Some(config) => config,
        None => {
            return Transition::new(None, vec![Effect::ClearInactive(state.instrument)]);
        }
    };

    let status = ctx.market.status(&state.name, ctx.now);
    if config.respect_market_hours && !status.is_open {
        tracing::info!(feed = ctx.feed, "Market closed for {} before timer fired, dropping monitor", state.name);
        return Transition::new(None, vec![Effect::ClearInactive(state.instrument)]);
    }

    let alert = Alert::inactivity(ctx.feed, &state, config, &status, ctx.now);
    tracing::warn!(feed = ctx.feed, "{}", alert.format_message());

    state.inactive = true;
    let effects = vec![
        Effect::EmitAlert(alert),
        Effect::MarkInactive(state.instrument.clone()),
    ];

    Transition::new(Some(state), effects)
}

/// Re-arm a monitor whose inactivity alert was dismissed while its price
/// stayed flat. Baseline and history are kept; a paused monitor only loses
/// its inactive flag and is armed again once its market reopens.
pub fn rearm_after_clear(
    config: Option<&InstrumentConfig>,
    mut state: MonitorState,
    ctx: &EvalContext<'_>,
) -> Transition {
    let mut effects = Vec::new();
    if !state.inactive {
        return Transition::new(Some(state), effects);
    }
    state.inactive = false;

    let config = match enabled(config) {
        Some(config) => config,
        None => {
            state.disarm(&mut effects);
            return Transition::new(None, effects);
        }
    };

    if config.respect_market_hours && !state.market_open {
        return Transition::new(Some(state), effects);
    }

    tracing::debug!(feed = ctx.feed, "Alerts cleared, re-arming {} at baseline {}", state.name, state.baseline);
    state.arm(config, ctx.now, &mut effects);
    Transition::new(Some(state), effects)
}

/// Keep only the latest tick per instrument by receipt time.
/// Ties go to the later entry; first-seen order is preserved.
pub fn dedupe_latest(ticks: Vec<Tick>) -> Vec<Tick> {
    let mut slots: HashMap<InstrumentId, usize> = HashMap::new();
    let mut latest: Vec<Tick> = Vec::new();

    for tick in ticks {
        match slots.get(&tick.instrument) {
            Some(&idx) => {
                if tick.received_at >= latest[idx].received_at {
                    latest[idx] = tick;
                }
            }
            None => {
                slots.insert(tick.instrument.clone(), latest.len());
                latest.push(tick);
            }
        }
    }

    latest
}
