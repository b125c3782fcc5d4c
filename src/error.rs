//! Error types for the inactivity monitor
//!
//! Nothing in here is fatal to the process: transport faults trigger a
//! reconnect, parse faults skip the offending entry, configuration faults
//! leave the previous configuration in effect.

use thiserror::Error;

/// Main error type for the monitor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stale data: {0}")]
    StaleData(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Connection-level failures. Always recovered by reconnecting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to establish connection: {0}")]
    EstablishmentFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Unexpected response status: {0}")]
    BadStatus(u16),

    #[error("Timeout occurred: {0}")]
    Timeout(String),
}

/// Payload-level failures. The offending entry (or batch) is skipped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

/// Rejected configuration. The prior valid configuration stays in effect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Deviation must be positive, got {0}")]
    InvalidDeviation(String),

    #[error("Duration must be a positive number of seconds")]
    InvalidDuration,

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("Failed to load instrument file: {0}")]
    InstrumentFile(String),
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn from_error(error: &MonitorError) -> Self {
        match error {
            MonitorError::Transport(TransportError::Timeout(_)) => ErrorSeverity::Medium,
            MonitorError::Transport(_) => ErrorSeverity::High,
            MonitorError::Parse(_) => ErrorSeverity::Low,
            MonitorError::Config(_) => ErrorSeverity::Medium,
            MonitorError::StaleData(_) => ErrorSeverity::High,
            MonitorError::ChannelClosed(_) => ErrorSeverity::Critical,
        }
    }
}

/// Routes errors to the tracing level matching their severity
pub struct ErrorReporter;

impl ErrorReporter {
    pub fn report(feed: &str, error: &MonitorError) -> ErrorSeverity {
        let severity = ErrorSeverity::from_error(error);

        match severity {
            ErrorSeverity::Critical => {
                tracing::error!(feed, "CRITICAL: {}", error);
            }
            ErrorSeverity::High => {
                tracing::error!(feed, "{}", error);
            }
            ErrorSeverity::Medium => {
                tracing::warn!(feed, "{}", error);
            }
            ErrorSeverity::Low => {
                tracing::debug!(feed, "{}", error);
            }
        }

        severity
    }
}
