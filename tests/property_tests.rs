//! Property-based tests using quickcheck

use chrono::{DateTime, Utc};
use inactivity_monitor::{
    connection::ReconnectStrategy,
    data::{EngineConfig, InstrumentConfig, ReconnectConfig, Tick},
    engine::{evaluate, on_timer_fired, Effect, EvalContext, MonitorState},
    session::{classify, current_status, AlwaysOpen, MarketHours, MarketStatus, MarketType, SessionKind},
};
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use rust_decimal::Decimal;
use std::time::Duration;

const EPOCH: i64 = 1_755_150_000;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(EPOCH + secs, 0).unwrap()
}

/// Prices in hundredths, kept small and non-negative
fn price(cents: u16) -> Decimal {
    Decimal::new(i64::from(cents), 2)
}

fn tick(cents: u16, secs: i64) -> Tick {
    Tick {
        instrument: "P".to_string(),
        name: None,
        last_price: price(cents),
        volume: 0,
        last_quantity: 0,
        average_price: price(cents),
        close_price: None,
        exchange_timestamp: at(secs),
        received_at: at(secs),
        delay_ms: 0,
    }
}

fn ctx<'a>(market: &'a dyn MarketHours, engine: &'a EngineConfig, secs: i64) -> EvalContext<'a> {
    EvalContext {
        feed: "prop",
        market,
        engine,
        now: at(secs),
    }
}

struct Closed;

impl MarketHours for Closed {
    fn status(&self, _name: &str, _now: DateTime<Utc>) -> MarketStatus {
        MarketStatus {
            is_open: false,
            market_type: MarketType::Equity,
            session: SessionKind::Closed,
            reason: "Outside trading hours".to_string(),
            session_end: None,
            next_open: None,
        }
    }
}

/// Drive one monitor through a tick sequence, one tick per second
fn run(prices: &[u16], config: &InstrumentConfig, engine: &EngineConfig) -> (Option<MonitorState>, Vec<Effect>) {
    let mut state = None;
    let mut effects = Vec::new();
    for (i, cents) in prices.iter().enumerate() {
        let tr = evaluate(&tick(*cents, i as i64), Some(config), state, &ctx(&AlwaysOpen, engine, i as i64));
        state = tr.state;
        effects.extend(tr.effects);
    }
    (state, effects)
}

#[quickcheck]
fn prop_classify_is_idempotent(name: String, offset: u32) -> bool {
    let now = at(i64::from(offset));
    let first = classify(&name);
    first == classify(&name) && current_status(first, now) == current_status(classify(&name), now)
}

#[quickcheck]
fn prop_backoff_is_bounded(base_ms: u16, extra_ms: u16, attempt: u32) -> TestResult {
    if base_ms == 0 {
        return TestResult::discard();
    }
    let config = ReconnectConfig {
        base_delay: Duration::from_millis(u64::from(base_ms)),
        max_delay: Duration::from_millis(u64::from(base_ms) + u64::from(extra_ms)),
    };
    let strategy = ReconnectStrategy::new(config.clone());
    let delay = strategy.delay_for(attempt);

    TestResult::from_bool(
        delay >= config.base_delay
            && delay <= config.max_delay
            && strategy.delay_for(attempt.saturating_add(1)) >= delay,
    )
}

#[quickcheck]
fn prop_generation_matches_arm_count(prices: Vec<u16>, deviation: u8) -> TestResult {
    if prices.is_empty() || deviation == 0 {
        return TestResult::discard();
    }
    let engine = EngineConfig::default();
    let config = InstrumentConfig::new(Decimal::new(i64::from(deviation), 2), 30);
    let (state, effects) = run(&prices, &config, &engine);

    let arms: Vec<u64> = effects
        .iter()
        .filter_map(|e| match e {
            Effect::ArmTimer { generation, .. } => Some(*generation),
            _ => None,
        })
        .collect();
    let state = state.unwrap();

    // Every arm supersedes the previous one with a strictly newer generation
    let increasing = arms.windows(2).all(|w| w[1] == w[0] + 1);
    TestResult::from_bool(
        increasing
            && arms.last().copied() == Some(state.generation)
            && state.timer.map(|t| t.generation) == Some(state.generation),
    )
}

#[quickcheck]
fn prop_movement_means_no_alert_for_old_generation(base: u16, jump: u16) -> TestResult {
    if jump <= 10 {
        return TestResult::discard();
    }
    let engine = EngineConfig::default();
    let config = InstrumentConfig::new(Decimal::new(10, 2), 30);
    let moved = base.saturating_add(jump);
    if moved - base <= 10 {
        return TestResult::discard();
    }

    let (state, _) = run(&[base, base, moved], &config, &engine);
    let state = state.unwrap();
    assert_eq!(state.generation, 2);

    let stale = on_timer_fired(1, Some(&config), Some(state.clone()), &ctx(&AlwaysOpen, &engine, 30));
    let current = on_timer_fired(2, Some(&config), Some(state), &ctx(&AlwaysOpen, &engine, 32));

    TestResult::from_bool(
        stale.effects.is_empty()
            && current
                .effects
                .iter()
                .any(|e| matches!(e, Effect::EmitAlert(alert) if alert.baseline == price(moved))),
    )
}

#[quickcheck]
fn prop_history_stays_bounded(prices: Vec<u16>) -> bool {
    let engine = EngineConfig {
        history_cap: 16,
        ..EngineConfig::default()
    };
    let config = InstrumentConfig::new(Decimal::new(1, 2), 30);
    match run(&prices, &config, &engine).0 {
        Some(state) => {
            let range = state.price_range();
            !state.history.is_empty() && state.history.len() <= 16 && range.min <= range.max
        }
        None => prices.is_empty(),
    }
}

#[quickcheck]
fn prop_rebuilt_monitor_starts_at_latest_price(prices: Vec<u16>) -> TestResult {
    let latest = match prices.last() {
        Some(latest) => *latest,
        None => return TestResult::discard(),
    };
    let engine = EngineConfig::default();
    let config = InstrumentConfig::new(Decimal::new(5, 2), 30);
    let (before, _) = run(&prices, &config, &engine);
    let last_seen = before.unwrap().last_tick;

    // Reconfiguration discards the old monitor and rebuilds from the latest tick
    let rebuilt = evaluate(&last_seen, Some(&config), None, &ctx(&AlwaysOpen, &engine, prices.len() as i64));
    let state = rebuilt.state.unwrap();
    TestResult::from_bool(
        state.baseline == price(latest) && state.history.len() == 1 && state.generation == 1,
    )
}

#[quickcheck]
fn prop_closed_market_never_arms(prices: Vec<u16>) -> bool {
    let engine = EngineConfig::default();
    let config = InstrumentConfig::new(Decimal::new(1, 2), 30);
    let mut state = None;

    for (i, cents) in prices.iter().enumerate() {
        let tr = evaluate(&tick(*cents, i as i64), Some(&config), state, &ctx(&Closed, &engine, i as i64));
        if tr.effects.iter().any(|e| matches!(e, Effect::ArmTimer { .. })) {
            return false;
        }
        state = tr.state;
    }

    state.map_or(true, |s| !s.is_armed() && s.history.len() == 1)
}
