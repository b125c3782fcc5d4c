//! Market session oracle
//!
//! Pure lookups: instrument name → market type, and (market type, instant) →
//! session status. All wall-clock arithmetic happens in the exchange's fixed
//! UTC+05:30 offset. No I/O, no state beyond the static holiday table.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange offset from UTC, in seconds
pub const EXCHANGE_UTC_OFFSET_SECS: i64 = 5 * 3600 + 30 * 60;

/// How far ahead `next_open` is searched
const NEXT_OPEN_SEARCH_DAYS: i64 = 14;

/// Market classification of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketType {
    Equity,
    Currency,
    Commodity,
    Bond,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketType::Equity => "Equity",
            MarketType::Currency => "Currency",
            MarketType::Commodity => "Commodity",
            MarketType::Bond => "Bond",
        };
        f.write_str(s)
    }
}

/// Trading session an instant falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    Closed,
    PreMarket,
    Normal,
    PostMarket,
    Extended,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionKind::Closed => "Closed",
            SessionKind::PreMarket => "Pre-market",
            SessionKind::Normal => "Normal",
            SessionKind::PostMarket => "Post-market",
            SessionKind::Extended => "Extended",
        };
        f.write_str(s)
    }
}

/// Derived market status, never stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatus {
    pub is_open: bool,
    pub market_type: MarketType,
    pub session: SessionKind,
    pub reason: String,
    /// End of the current session, when open
    pub session_end: Option<DateTime<Utc>>,
    /// Estimated start of the next session, when closed
    pub next_open: Option<DateTime<Utc>>,
}

impl MarketStatus {
    fn closed(market_type: MarketType, reason: &str, next_open: Option<DateTime<Utc>>) -> Self {
        Self {
            is_open: false,
            market_type,
            session: SessionKind::Closed,
            reason: reason.to_string(),
            session_end: None,
            next_open,
        }
    }
}

/// Inclusive time-of-day window, in seconds after exchange midnight.
/// `end < start` marks an overnight window that wraps past midnight.
#[derive(Debug, Clone, Copy)]
struct SessionWindow {
    kind: SessionKind,
    start: u32,
    end: u32,
}

const fn window(kind: SessionKind, start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> SessionWindow {
    SessionWindow {
        kind,
        start: start_h * 3600 + start_m * 60,
        end: end_h * 3600 + end_m * 60,
    }
}

impl SessionWindow {
    fn is_overnight(&self) -> bool {
        self.end < self.start
    }

    /// Whether `secs` lies in the leg after midnight of an overnight window
    fn in_morning_leg(&self, secs: u32) -> bool {
        self.is_overnight() && secs <= self.end
    }

    fn contains(&self, secs: u32) -> bool {
        if self.is_overnight() {
            secs >= self.start || secs <= self.end
        } else {
            self.start <= secs && secs <= self.end
        }
    }
}

// Ordered by priority: the first matching window wins.
const EQUITY_SESSIONS: &[SessionWindow] = &[
    window(SessionKind::PreMarket, 9, 0, 9, 15),
    window(SessionKind::Normal, 9, 15, 15, 30),
    window(SessionKind::PostMarket, 15, 40, 16, 0),
];

const CURRENCY_SESSIONS: &[SessionWindow] = &[window(SessionKind::Normal, 9, 0, 17, 0)];

const BOND_SESSIONS: &[SessionWindow] = &[window(SessionKind::Normal, 9, 0, 17, 0)];

const COMMODITY_SESSIONS: &[SessionWindow] = &[
    window(SessionKind::Normal, 9, 0, 17, 0),
    window(SessionKind::Extended, 17, 0, 0, 30),
];

fn sessions_for(market_type: MarketType) -> &'static [SessionWindow] {
    match market_type {
        MarketType::Equity => EQUITY_SESSIONS,
        MarketType::Currency => CURRENCY_SESSIONS,
        MarketType::Bond => BOND_SESSIONS,
        MarketType::Commodity => COMMODITY_SESSIONS,
    }
}

const CURRENCY_KEYWORDS: &[&str] = &["USDINR", "EURINR", "GBPINR", "JPYINR", "CDS"];

const COMMODITY_KEYWORDS: &[&str] = &[
    "GOLD", "SILVER", "CRUDE", "NATURALGAS", "COPPER", "ZINC", "LEAD", "NICKEL", "ALUMINIUM",
    "MCX", "COTTON", "MENTHA",
];

const BOND_KEYWORDS: &[&str] = &["GSEC", "GILT", "BOND", "TBILL", "SDL"];

/// Exchange holidays, exchange-local dates
const HOLIDAYS: &[(i32, u32, u32)] = &[
    // 2025
    (2025, 2, 26),
    (2025, 3, 14),
    (2025, 3, 31),
    (2025, 4, 10),
    (2025, 4, 14),
    (2025, 4, 18),
    (2025, 5, 1),
    (2025, 8, 15),
    (2025, 8, 27),
    (2025, 10, 2),
    (2025, 10, 21),
    (2025, 10, 22),
    (2025, 11, 5),
    (2025, 12, 25),
    // 2026
    (2026, 1, 26),
    (2026, 3, 3),
    (2026, 3, 26),
    (2026, 3, 31),
    (2026, 4, 3),
    (2026, 4, 14),
    (2026, 5, 1),
    (2026, 5, 28),
    (2026, 6, 26),
    (2026, 9, 14),
    (2026, 10, 2),
    (2026, 10, 20),
    (2026, 11, 10),
    (2026, 11, 24),
    (2026, 12, 25),
];

/// Classify an instrument by its display name. Total: unknown names are equities.
pub fn classify(instrument_name: &str) -> MarketType {
    let upper = instrument_name.to_uppercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|k| upper.contains(k));

    if matches(CURRENCY_KEYWORDS) {
        MarketType::Currency
    } else if matches(COMMODITY_KEYWORDS) {
        MarketType::Commodity
    } else if matches(BOND_KEYWORDS) {
        MarketType::Bond
    } else {
        MarketType::Equity
    }
}

/// Session status of `market_type` at `now`
pub fn current_status(market_type: MarketType, now: DateTime<Utc>) -> MarketStatus {
    let local = to_exchange_time(now);
    let date = local.date();

    if is_weekend(date) {
        return MarketStatus::closed(market_type, "Weekend", next_open(market_type, local));
    }

    if is_holiday(date) {
        return MarketStatus::closed(market_type, "Holiday", next_open(market_type, local));
    }

    let secs = local.num_seconds_from_midnight();
    for session in sessions_for(market_type) {
        if !session.contains(secs) {
            continue;
        }

        // The post-midnight leg belongs to a session opened the previous day.
        if session.in_morning_leg(secs) && !is_trading_day(date - Duration::days(1)) {
            continue;
        }

        let end_date = if session.is_overnight() && secs >= session.start {
            date + Duration::days(1)
        } else {
            date
        };

        return MarketStatus {
            is_open: true,
            market_type,
            session: session.kind,
            reason: format!("{} session", session.kind),
            session_end: Some(from_exchange_time(at_secs(end_date, session.end))),
            next_open: None,
        };
    }

    MarketStatus::closed(market_type, "Outside trading hours", next_open(market_type, local))
}

/// Whether alerts for `instrument_name` should be live at `now`
pub fn should_alert_be_active(instrument_name: &str, now: DateTime<Utc>) -> bool {
    current_status(classify(instrument_name), now).is_open
}

/// Earliest session start strictly after `local` on a trading day
fn next_open(market_type: MarketType, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let sessions = sessions_for(market_type);

    (0..NEXT_OPEN_SEARCH_DAYS)
        .map(|offset| local.date() + Duration::days(offset))
        .filter(|date| is_trading_day(*date))
        .find_map(|date| {
            sessions
                .iter()
                .map(|s| at_secs(date, s.start))
                .filter(|start| *start > local)
                .min()
        })
        .map(from_exchange_time)
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn is_holiday(date: NaiveDate) -> bool {
    HOLIDAYS.contains(&(date.year(), date.month(), date.day()))
}

fn is_trading_day(date: NaiveDate) -> bool {
    !is_weekend(date) && !is_holiday(date)
}

fn at_secs(date: NaiveDate, secs: u32) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::default()) + Duration::seconds(i64::from(secs))
}

fn to_exchange_time(now: DateTime<Utc>) -> NaiveDateTime {
    now.naive_utc() + Duration::seconds(EXCHANGE_UTC_OFFSET_SECS)
}

fn from_exchange_time(local: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - Duration::seconds(EXCHANGE_UTC_OFFSET_SECS)))
}

/// Seam through which the engine asks whether an instrument is tradeable
pub trait MarketHours: Send + Sync {
    fn status(&self, instrument_name: &str, now: DateTime<Utc>) -> MarketStatus;

    fn is_open(&self, instrument_name: &str, now: DateTime<Utc>) -> bool {
        self.status(instrument_name, now).is_open
    }
}

/// Calendar-backed market hours
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOracle;

impl MarketHours for SessionOracle {
    fn status(&self, instrument_name: &str, now: DateTime<Utc>) -> MarketStatus {
        current_status(classify(instrument_name), now)
    }
}

/// Market hours for round-the-clock instruments
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl MarketHours for AlwaysOpen {
    fn status(&self, instrument_name: &str, _now: DateTime<Utc>) -> MarketStatus {
        MarketStatus {
            is_open: true,
            market_type: classify(instrument_name),
            session: SessionKind::Normal,
            reason: "Always open".to_string(),
            session_end: None,
            next_open: None,
        }
    }
}
