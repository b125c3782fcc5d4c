//! Message parsing and payload normalization
//!
//! Two upstream shapes are understood: flat tick arrays carried by named
//! `tick` events, and the `live_feed` envelope carried by unnamed events.
//! Both are decoded into [`RawTickPayload`] and normalized into [`Tick`].

use crate::{
    data::{InstrumentId, Tick},
    error::ParseError,
    session::EXCHANGE_UTC_OFFSET_SECS,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Event name of the flat tick-array framing
pub const TICK_EVENT: &str = "tick";

/// Envelope type carrying live-feed updates
pub const LIVE_FEED_TYPE: &str = "live_feed";

/// Epoch values above this are read as milliseconds
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

/// Flat tick object from the named-event feed
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyTick {
    pub instrument_token: InstrumentId,
    pub tradingsymbol: Option<String>,
    pub last_price: Decimal,
    pub volume_traded: u64,
    pub average_traded_price: Decimal,
    pub last_traded_quantity: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One entry of a `live_feed` envelope
#[derive(Debug, Clone, PartialEq)]
pub struct LiveFeedTick {
    pub key: InstrumentId,
    pub ltp: Decimal,
    pub ltq: Option<u64>,
    pub cp: Option<Decimal>,
    pub ltt: Option<DateTime<Utc>>,
    pub volume: Option<u64>,
}

/// Tagged union over the upstream payload shapes
#[derive(Debug, Clone, PartialEq)]
pub enum RawTickPayload {
    Legacy(LegacyTick),
    LiveFeed(LiveFeedTick),
}

impl RawTickPayload {
    pub fn instrument(&self) -> &str {
        match self {
            RawTickPayload::Legacy(t) => &t.instrument_token,
            RawTickPayload::LiveFeed(t) => &t.key,
        }
    }

    /// Convert into the canonical tick. Delay is filled in by the connector.
    pub fn normalize(self, received_at: DateTime<Utc>) -> Tick {
        match self {
            RawTickPayload::Legacy(t) => Tick {
                instrument: t.instrument_token,
                name: t.tradingsymbol,
                last_price: t.last_price,
                volume: t.volume_traded,
                last_quantity: t.last_traded_quantity,
                average_price: t.average_traded_price,
                close_price: None,
                exchange_timestamp: t.timestamp.unwrap_or(received_at),
                received_at,
                delay_ms: 0,
            },
            RawTickPayload::LiveFeed(t) => Tick {
                name: Some(t.key.clone()),
                instrument: t.key,
                last_price: t.ltp,
                volume: t.volume.unwrap_or(0),
                last_quantity: t.ltq.unwrap_or(0),
                average_price: Decimal::ZERO,
                close_price: t.cp,
                exchange_timestamp: t.ltt.unwrap_or(received_at),
                received_at,
                delay_ms: 0,
            },
        }
    }
}

/// Result of decoding one inbound message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBatch {
    pub payloads: Vec<RawTickPayload>,
    /// Entries that were skipped, one error each
    pub errors: Vec<ParseError>,
}

/// Trait for decoding feed messages
pub trait PayloadParser: Send + Sync {
    /// `Ok(None)` means the event carries no tick data and is ignored.
    fn parse_event(&self, event: &str, data: &str) -> Result<Option<ParsedBatch>, ParseError>;
}

/// Parser for both supported framings
#[derive(Debug, Clone, Default)]
pub struct TickParser;

impl TickParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a flat tick array
    pub fn parse_tick_array(&self, json: &Value) -> Result<ParsedBatch, ParseError> {
        let entries = json
            .as_array()
            .ok_or_else(|| ParseError::MalformedMessage("tick batch is not an array".to_string()))?;

        let mut batch = ParsedBatch::default();
        for (index, entry) in entries.iter().enumerate() {
            match self.parse_legacy_entry(entry) {
                Ok(tick) => batch.payloads.push(RawTickPayload::Legacy(tick)),
                Err(e) => {
                    tracing::debug!("Skipping tick entry {}: {}", index, e);
                    batch.errors.push(e);
                }
            }
        }

        Ok(batch)
    }

    /// Parse a `live_feed` envelope. Other envelope types yield `None`.
    pub fn parse_envelope(&self, json: &Value) -> Result<Option<ParsedBatch>, ParseError> {
        let obj = json
            .as_object()
            .ok_or_else(|| ParseError::MalformedMessage("envelope is not an object".to_string()))?;

        match obj.get("type").and_then(|v| v.as_str()) {
            Some(LIVE_FEED_TYPE) => {}
            Some(other) => {
                tracing::debug!("Ignoring envelope of type {}", other);
                return Ok(None);
            }
            None => return Err(ParseError::MissingField("type".to_string())),
        }

        let feeds = obj
            .get("feeds")
            .and_then(|v| v.as_object())
            .ok_or_else(|| ParseError::MissingField("feeds".to_string()))?;

        let mut batch = ParsedBatch::default();
        for (key, entry) in feeds {
            match self.parse_live_entry(key, entry) {
                Ok(Some(tick)) => batch.payloads.push(RawTickPayload::LiveFeed(tick)),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("Skipping live feed entry {}: {}", key, e);
                    batch.errors.push(e);
                }
            }
        }

        Ok(Some(batch))
    }

    fn parse_legacy_entry(&self, entry: &Value) -> Result<LegacyTick, ParseError> {
        let obj = entry
            .as_object()
            .ok_or_else(|| ParseError::MalformedMessage("tick entry is not an object".to_string()))?;

        Ok(LegacyTick {
            instrument_token: extract_key(obj, "instrument_token")?,
            tradingsymbol: obj
                .get("tradingsymbol")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            last_price: extract_decimal(obj, "last_price")?.unwrap_or(Decimal::ZERO),
            volume_traded: extract_u64(obj, "volume_traded")?.unwrap_or(0),
            average_traded_price: extract_decimal(obj, "average_traded_price")?
                .unwrap_or(Decimal::ZERO),
            last_traded_quantity: extract_u64(obj, "last_traded_quantity")?.unwrap_or(0),
            timestamp: extract_timestamp(obj, "timestamp")?,
        })
    }

    fn parse_live_entry(&self, key: &str, entry: &Value) -> Result<Option<LiveFeedTick>, ParseError> {
        let ff = entry
            .get("ff")
            .and_then(|v| v.as_object())
            .ok_or_else(|| ParseError::MissingField(format!("{}.ff", key)))?;

        let market = match ff.get("marketFF").or_else(|| ff.get("indexFF")) {
            Some(Value::Object(m)) => m,
            _ => return Ok(None),
        };

        let ltpc = match market.get("ltpc") {
            Some(Value::Object(l)) => l,
            _ => return Ok(None),
        };

        let ltp = match extract_decimal(ltpc, "ltp")? {
            Some(ltp) => ltp,
            None => return Ok(None),
        };

        let volume = market
            .get("marketOHLC")
            .and_then(|o| o.get("ohlc"))
            .and_then(|o| o.as_array())
            .and_then(|candles| candles.last())
            .and_then(|c| c.as_object())
            .map(|c| match extract_u64(c, "volume")? {
                Some(v) => Ok(Some(v)),
                None => extract_u64(c, "vol"),
            })
            .transpose()?
            .flatten();

        Ok(Some(LiveFeedTick {
            key: key.to_string(),
            ltp,
            ltq: extract_u64(ltpc, "ltq")?,
            cp: extract_decimal(ltpc, "cp")?,
            ltt: extract_timestamp(ltpc, "ltt")?,
            volume,
        }))
    }
}

impl PayloadParser for TickParser {
    fn parse_event(&self, event: &str, data: &str) -> Result<Option<ParsedBatch>, ParseError> {
        let is_tick_event = event == TICK_EVENT;
        if !is_tick_event && event != crate::sse::DEFAULT_EVENT {
            tracing::debug!("Ignoring event {}", event);
            return Ok(None);
        }

        let json = parse_json(data)?;
        match &json {
            Value::Array(_) => self.parse_tick_array(&json).map(Some),
            Value::Object(_) if !is_tick_event => self.parse_envelope(&json),
            _ => Err(ParseError::MalformedMessage(format!(
                "unexpected payload for event {}",
                event
            ))),
        }
    }
}

fn parse_json(data: &str) -> Result<Value, ParseError> {
    serde_json::from_str(data.trim())
        .map_err(|e| ParseError::InvalidJson(format!("JSON parsing failed: {}", e)))
}

/// Instrument key: a number or a non-empty string
fn extract_key(obj: &Map<String, Value>, field: &str) -> Result<InstrumentId, ParseError> {
    match obj.get(field) {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(ParseError::InvalidDataType(format!("{}: {}", field, other))),
        None => Err(ParseError::MissingField(field.to_string())),
    }
}

/// Non-negative decimal; absent or null yields `None`
fn extract_decimal(obj: &Map<String, Value>, field: &str) -> Result<Option<Decimal>, ParseError> {
    let text = match obj.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => {
            return Err(ParseError::InvalidDataType(format!("{}: {}", field, other)));
        }
    };

    let value = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| ParseError::InvalidDataType(format!("Invalid decimal for {}: {}", field, e)))?;

    if value.is_sign_negative() && !value.is_zero() {
        return Err(ParseError::InvalidDataType(format!("{} is negative: {}", field, value)));
    }

    Ok(Some(value.normalize()))
}

/// Non-negative integer; integral floats and numeric strings are accepted
fn extract_u64(obj: &Map<String, Value>, field: &str) -> Result<Option<u64>, ParseError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                return Ok(Some(v));
            }
            match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(Some(f as u64)),
                _ => Err(ParseError::InvalidDataType(format!("{}: {}", field, n))),
            }
        }
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ParseError::InvalidDataType(format!("Invalid integer for {}: {}", field, e))),
        Some(other) => Err(ParseError::InvalidDataType(format!("{}: {}", field, other))),
    }
}

/// Epoch seconds or milliseconds, RFC 3339, or a naive exchange-local datetime
fn extract_timestamp(obj: &Map<String, Value>, field: &str) -> Result<Option<DateTime<Utc>>, ParseError> {
    let invalid = |detail: String| ParseError::InvalidDataType(format!("Invalid timestamp for {}: {}", field, detail));

    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let epoch = n.as_f64().ok_or_else(|| invalid(n.to_string()))?;
            from_epoch(epoch).map(Some).ok_or_else(|| invalid(n.to_string()))
        }
        Some(Value::String(s)) => {
            let s = s.trim();
            if let Ok(epoch) = s.parse::<f64>() {
                return from_epoch(epoch).map(Some).ok_or_else(|| invalid(s.to_string()));
            }

            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(dt.with_timezone(&Utc)));
            }

            ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|local| {
                    Some(Utc.from_utc_datetime(
                        &(local - chrono::Duration::seconds(EXCHANGE_UTC_OFFSET_SECS)),
                    ))
                })
                .ok_or_else(|| invalid(s.to_string()))
        }
        Some(other) => Err(invalid(other.to_string())),
    }
}

fn from_epoch(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }

    let millis = if epoch > MILLIS_THRESHOLD {
        epoch as i64
    } else {
        (epoch * 1000.0).round() as i64
    };

    DateTime::from_timestamp_millis(millis)
}
