//! Data models shared by the feed connector, the engine and the alert sink

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque instrument key, unique per instrument within a feed
pub type InstrumentId = String;

/// Normalized tick record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub instrument: InstrumentId,
    /// Trading symbol as reported by the feed, if any
    pub name: Option<String>,
    pub last_price: Decimal,
    pub volume: u64,
    pub last_quantity: u64,
    pub average_price: Decimal,
    pub close_price: Option<Decimal>,
    /// Event time as reported by the source
    pub exchange_timestamp: DateTime<Utc>,
    /// Local receipt time
    pub received_at: DateTime<Utc>,
    /// Gap to the previous tick of the same instrument, in milliseconds
    pub delay_ms: u64,
}

impl Tick {
    /// Name used for market classification and alert display
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.instrument)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tick[{}]: last={}, vol={}, qty={}, avg={}, delay={}ms @ {}",
            self.display_name(),
            self.last_price,
            self.volume,
            self.last_quantity,
            self.average_price,
            self.delay_ms,
            self.exchange_timestamp
        )
    }
}

/// One retained price observation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Observed min/max over the monitored interval
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl fmt::Display for PriceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

/// Per-instrument monitoring configuration.
///
/// Replaced wholesale on update; there is no partial merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentConfig {
    pub enabled: bool,
    /// Price movement (absolute, in price units) that counts as activity
    pub deviation: Decimal,
    /// Seconds without movement before an alert fires
    pub duration_secs: u64,
    #[serde(default = "default_respect_market_hours")]
    pub respect_market_hours: bool,
}

fn default_respect_market_hours() -> bool {
    true
}

impl InstrumentConfig {
    pub fn new(deviation: Decimal, duration_secs: u64) -> Self {
        Self {
            enabled: true,
            deviation,
            duration_secs,
            respect_market_hours: true,
        }
    }

    pub fn ignoring_market_hours(mut self) -> Self {
        self.respect_market_hours = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deviation <= Decimal::ZERO {
            return Err(ConfigError::InvalidDeviation(self.deviation.to_string()));
        }

        if self.duration_secs == 0 {
            return Err(ConfigError::InvalidDuration);
        }

        Ok(())
    }
}

/// Connection state of one feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectConfig {
    /// Validate reconnection configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::InvalidSetting {
                key: "base_delay".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.max_delay < self.base_delay {
            return Err(ConfigError::InvalidSetting {
                key: "max_delay".to_string(),
                reason: "must be greater than or equal to base delay".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Idle timeout for the primary feed
pub const PRIMARY_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle timeout for ancillary feeds
pub const ANCILLARY_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for one external feed
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Capacity of the coordinator queue
    pub queue_capacity: usize,
}

impl FeedConfig {
    /// Primary feed with the short freeze timeout
    pub fn primary(name: &str, url: &str) -> Self {
        FeedConfigBuilder::new(name, url).build()
    }

    /// Ancillary feed with the long freeze timeout
    pub fn ancillary(name: &str, url: &str) -> Self {
        FeedConfigBuilder::new(name, url)
            .idle_timeout(ANCILLARY_IDLE_TIMEOUT)
            .build()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.url, e)))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: event streams need http or https",
                self.url
            )));
        }

        if self.name.is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "name".to_string(),
                reason: "feed name cannot be empty".to_string(),
            });
        }

        if self.connect_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidSetting {
                key: "timeout".to_string(),
                reason: "timeouts must be greater than 0".to_string(),
            });
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "queue_capacity".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        self.reconnect.validate()
    }
}

/// Builder pattern for feed configuration
pub struct FeedConfigBuilder {
    config: FeedConfig,
}

impl FeedConfigBuilder {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            config: FeedConfig {
                name: name.to_string(),
                url: url.to_string(),
                headers: Vec::new(),
                connect_timeout: Duration::from_secs(15),
                idle_timeout: PRIMARY_IDLE_TIMEOUT,
                reconnect: ReconnectConfig::default(),
                queue_capacity: 1024,
            },
        }
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.config.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn build(self) -> FeedConfig {
        self.config
    }
}

/// Tunables of the inactivity engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Minimum spacing between market-status lookups for one monitor
    pub status_check_interval: Duration,
    /// Trailing window of retained price history
    pub history_retention: Duration,
    /// Hard cap on retained history entries
    pub history_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            status_check_interval: Duration::from_secs(60),
            history_retention: Duration::from_secs(5 * 60),
            history_cap: 100,
        }
    }
}
