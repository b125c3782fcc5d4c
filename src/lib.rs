//! # Inactivity Monitor
//!
//! Ingests streaming price ticks for many instruments and raises an alert
//! when an instrument's price stops moving beyond a configured threshold for
//! a configured duration, while respecting each instrument's trading session.
//!
//! ## Quick Start
//! ```rust,ignore
//! use inactivity_monitor::prelude::*;
//! use rust_decimal_macros::dec;
//!
//! let monitor = InactivityMonitor::builder()
//!     .observer(Arc::new(TracingObserver))
//!     .build();
//! monitor.configure("256265", InstrumentConfig::new(dec!(0.5), 60)).await?;
//! monitor.add_feed(FeedConfig::primary("live", "https://feed.example/stream"))?;
//! ```

pub mod alerts;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod data;
pub mod engine;
pub mod error;
pub mod events;
pub mod monitor;
pub mod parser;
pub mod session;
pub mod sse;

pub use alerts::{Alert, AlertSink, BroadcastObserver, TracingObserver};
pub use data::*;
pub use error::*;
pub use events::{AlertObserver, ObserverRegistry};

pub use monitor::{InactivityMonitor, InactivityMonitorBuilder};

pub use connection::{
    Diagnostic, DiagnosticKind, FeedConnector, FeedStatus, InstrumentTable, ReconnectStrategy,
};
pub use coordinator::{FeedCoordinator, MonitorEvent, MonotonicClock};
pub use engine::{evaluate, on_timer_fired, Effect, EvalContext, MonitorState, Transition};
pub use parser::{PayloadParser, RawTickPayload, TickParser};
pub use session::{
    classify, current_status, should_alert_be_active, AlwaysOpen, MarketHours, MarketStatus,
    MarketType, SessionKind, SessionOracle,
};

/// Prelude - minimal public API surface
///
/// Import with: `use inactivity_monitor::prelude::*;`
pub mod prelude {
    pub use crate::alerts::{Alert, TracingObserver};
    pub use crate::data::{FeedConfig, InstrumentConfig, Tick};
    pub use crate::error::{ConfigError, MonitorError};
    pub use crate::events::AlertObserver;
    pub use crate::monitor::{InactivityMonitor, InactivityMonitorBuilder};
    pub use crate::session::{MarketHours, MarketType, SessionOracle};
    pub use std::sync::Arc;
}

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::fmt::init();
}
