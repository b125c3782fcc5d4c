//! Process configuration from the environment and an instrument file

use crate::{
    data::{
        FeedConfig, FeedConfigBuilder, InstrumentConfig, InstrumentId, ReconnectConfig,
        ANCILLARY_IDLE_TIMEOUT, PRIMARY_IDLE_TIMEOUT,
    },
    error::ConfigError,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const FEEDS_VAR: &str = "MONITOR_FEEDS";
pub const PRIMARY_IDLE_VAR: &str = "MONITOR_PRIMARY_IDLE_SECS";
pub const ANCILLARY_IDLE_VAR: &str = "MONITOR_ANCILLARY_IDLE_SECS";
pub const CONNECT_TIMEOUT_VAR: &str = "MONITOR_CONNECT_TIMEOUT_SECS";
pub const RECONNECT_BASE_VAR: &str = "MONITOR_RECONNECT_BASE_SECS";
pub const RECONNECT_MAX_VAR: &str = "MONITOR_RECONNECT_MAX_SECS";
pub const INSTRUMENTS_FILE_VAR: &str = "MONITOR_INSTRUMENTS_FILE";
pub const AUTH_TOKEN_VAR: &str = "MONITOR_AUTH_TOKEN";

/// Everything the binary needs to start monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// The first feed is primary, the rest ancillary
    pub feeds: Vec<FeedConfig>,
    pub instruments: HashMap<InstrumentId, InstrumentConfig>,
}

impl AppConfig {
    /// Read the process environment (after loading `.env`, if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_feeds = lookup(FEEDS_VAR).ok_or_else(|| ConfigError::InvalidSetting {
            key: FEEDS_VAR.to_string(),
            reason: "not set".to_string(),
        })?;

        let primary_idle = secs(&lookup, PRIMARY_IDLE_VAR)?.unwrap_or(PRIMARY_IDLE_TIMEOUT);
        let ancillary_idle = secs(&lookup, ANCILLARY_IDLE_VAR)?.unwrap_or(ANCILLARY_IDLE_TIMEOUT);
        let connect_timeout = secs(&lookup, CONNECT_TIMEOUT_VAR)?;

        let defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            base_delay: secs(&lookup, RECONNECT_BASE_VAR)?.unwrap_or(defaults.base_delay),
            max_delay: secs(&lookup, RECONNECT_MAX_VAR)?.unwrap_or(defaults.max_delay),
        };
        reconnect.validate()?;

        let token = lookup(AUTH_TOKEN_VAR).filter(|t| !t.trim().is_empty());

        let mut feeds = Vec::new();
        for (index, (name, url)) in parse_feed_list(&raw_feeds)?.into_iter().enumerate() {
            let idle = if index == 0 { primary_idle } else { ancillary_idle };
            let mut builder = FeedConfigBuilder::new(&name, &url)
                .idle_timeout(idle)
                .reconnect(reconnect.clone());

            if let Some(timeout) = connect_timeout {
                builder = builder.connect_timeout(timeout);
            }
            if let Some(token) = &token {
                builder = builder.header("Authorization", &format!("Bearer {}", token.trim()));
            }

            let feed = builder.build();
            feed.validate()?;
            feeds.push(feed);
        }

        let instruments = match lookup(INSTRUMENTS_FILE_VAR) {
            Some(path) if !path.trim().is_empty() => load_instruments(path.trim())?,
            _ => HashMap::new(),
        };

        Ok(Self { feeds, instruments })
    }
}

/// Parse `name=url,name=url`
pub fn parse_feed_list(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut feeds: Vec<(String, String)> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, url) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidSetting {
            key: FEEDS_VAR.to_string(),
            reason: format!("expected name=url, got {:?}", entry),
        })?;

        let name = name.trim();
        if feeds.iter().any(|(existing, _)| existing == name) {
            return Err(ConfigError::InvalidSetting {
                key: FEEDS_VAR.to_string(),
                reason: format!("duplicate feed name {:?}", name),
            });
        }
        feeds.push((name.to_string(), url.trim().to_string()));
    }

    if feeds.is_empty() {
        return Err(ConfigError::InvalidSetting {
            key: FEEDS_VAR.to_string(),
            reason: "no feeds listed".to_string(),
        });
    }

    Ok(feeds)
}

/// Load a JSON map of instrument id to configuration
pub fn load_instruments<P: AsRef<Path>>(
    path: P,
) -> Result<HashMap<InstrumentId, InstrumentConfig>, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::InstrumentFile(format!("{}: {}", path.display(), e)))?;
    parse_instruments(&raw)
}

pub fn parse_instruments(raw: &str) -> Result<HashMap<InstrumentId, InstrumentConfig>, ConfigError> {
    let instruments: HashMap<InstrumentId, InstrumentConfig> =
        serde_json::from_str(raw).map_err(|e| ConfigError::InstrumentFile(e.to_string()))?;

    for config in instruments.values() {
        config.validate()?;
    }

    Ok(instruments)
}

fn secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|e| ConfigError::InvalidSetting {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}
