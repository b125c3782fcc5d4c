//! Integration tests for the inactivity monitor

use chrono::{DateTime, Utc};
use inactivity_monitor::{
    connection::{DiagnosticKind, FeedConnector},
    data::{ConnectionState, EngineConfig, FeedConfigBuilder, InstrumentConfig, ReconnectConfig, Tick},
    session::{MarketHours, MarketStatus, MarketType, SessionKind},
    InactivityMonitor, MonitorEvent,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Market hours switched by the test
struct TestMarket {
    open: AtomicBool,
}

impl TestMarket {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
        })
    }

    fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

impl MarketHours for TestMarket {
    fn status(&self, _instrument_name: &str, _now: DateTime<Utc>) -> MarketStatus {
        let is_open = self.open.load(Ordering::SeqCst);
        MarketStatus {
            is_open,
            market_type: MarketType::Equity,
            session: if is_open { SessionKind::Normal } else { SessionKind::Closed },
            reason: if is_open { "Normal" } else { "Outside trading hours" }.to_string(),
            session_end: None,
            next_open: None,
        }
    }
}

fn tick(instrument: &str, price: Decimal) -> Tick {
    let now = Utc::now();
    Tick {
        instrument: instrument.to_string(),
        name: Some(format!("{}-EQ", instrument)),
        last_price: price,
        volume: 100,
        last_quantity: 1,
        average_price: price,
        close_price: None,
        exchange_timestamp: now,
        received_at: now,
        delay_ms: 0,
    }
}

async fn send(queue: &mpsc::Sender<MonitorEvent>, instrument: &str, price: Decimal) {
    queue
        .send(MonitorEvent::Ticks(vec![tick(instrument, price)]))
        .await
        .unwrap();
}

/// One tick per second for `seconds` seconds
async fn steady(queue: &mpsc::Sender<MonitorEvent>, instrument: &str, price: Decimal, seconds: u64) {
    for _ in 0..seconds {
        send(queue, instrument, price).await;
        sleep(Duration::from_secs(1)).await;
    }
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

fn monitor_with(market: Arc<TestMarket>, engine: EngineConfig) -> InactivityMonitor {
    InactivityMonitor::builder()
        .market_hours(market)
        .engine(engine)
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_steady_price_alerts_once() {
    let monitor = monitor_with(TestMarket::new(), EngineConfig::default());
    let queue = monitor.add_channel_feed("primary").unwrap();
    let mut alerts = monitor.subscribe_alerts();
    monitor.configure("X", InstrumentConfig::new(dec!(0.1), 30)).await.unwrap();

    let start = tokio::time::Instant::now();
    steady(&queue, "X", dec!(100.00), 30).await;
    settle().await;

    let fired = monitor.get_alerts();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].baseline, dec!(100.00));
    assert_eq!(fired[0].range.min, dec!(100.00));
    assert_eq!(fired[0].range.max, dec!(100.00));
    assert_eq!(fired[0].duration_secs, 30);
    assert!(monitor.get_inactive_set().contains("X"));
    assert!(start.elapsed() >= Duration::from_secs(30));

    let streamed = alerts.try_recv().unwrap();
    assert_eq!(streamed.id, fired[0].id);

    // Still flat: no second alert for the same episode
    steady(&queue, "X", dec!(100.00), 40).await;
    settle().await;
    assert_eq!(monitor.get_alerts().len(), 1);

    // Movement ends the episode
    send(&queue, "X", dec!(100.50)).await;
    settle().await;
    assert!(monitor.get_inactive_set().is_empty());

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_movement_restarts_timer() {
    let monitor = monitor_with(TestMarket::new(), EngineConfig::default());
    let queue = monitor.add_channel_feed("primary").unwrap();
    monitor.configure("X", InstrumentConfig::new(dec!(0.1), 30)).await.unwrap();

    steady(&queue, "X", dec!(100.00), 10).await;
    steady(&queue, "X", dec!(100.20), 25).await;
    settle().await;

    // t = 35s: the original deadline has passed without an alert
    assert!(monitor.get_alerts().is_empty());

    steady(&queue, "X", dec!(100.20), 6).await;
    settle().await;

    let fired = monitor.get_alerts();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].baseline, dec!(100.20));
    assert_eq!(fired[0].range.min, dec!(100.00));
    assert_eq!(fired[0].range.max, dec!(100.20));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_market_close_cancels_timer() {
    let market = TestMarket::new();
    let engine = EngineConfig {
        status_check_interval: Duration::from_secs(1),
        ..EngineConfig::default()
    };
    let monitor = monitor_with(market.clone(), engine);
    let queue = monitor.add_channel_feed("primary").unwrap();
    monitor.configure("X", InstrumentConfig::new(dec!(0.1), 30)).await.unwrap();

    steady(&queue, "X", dec!(100.00), 15).await;
    market.set_open(false);
    steady(&queue, "X", dec!(100.00), 30).await;
    settle().await;

    assert!(monitor.get_alerts().is_empty());
    assert!(monitor.get_inactive_set().is_empty());

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_between_status_checks_is_caught_at_fire_time() {
    let market = TestMarket::new();
    let monitor = monitor_with(market.clone(), EngineConfig::default());
    let queue = monitor.add_channel_feed("primary").unwrap();
    monitor.configure("X", InstrumentConfig::new(dec!(0.1), 30)).await.unwrap();

    steady(&queue, "X", dec!(100.00), 15).await;
    market.set_open(false);
    sleep(Duration::from_secs(20)).await;

    assert!(monitor.get_alerts().is_empty());
    assert!(monitor.get_inactive_set().is_empty());

    // The dropped monitor is rebuilt from the first tick after reopening
    market.set_open(true);
    steady(&queue, "X", dec!(100.00), 29).await;
    settle().await;
    assert!(monitor.get_alerts().is_empty());

    steady(&queue, "X", dec!(100.00), 2).await;
    settle().await;
    assert_eq!(monitor.get_alerts().len(), 1);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ignoring_market_hours_alerts_while_closed() {
    let market = TestMarket::new();
    market.set_open(false);
    let monitor = monitor_with(market, EngineConfig::default());
    let queue = monitor.add_channel_feed("primary").unwrap();
    monitor
        .configure("X", InstrumentConfig::new(dec!(0.1), 5).ignoring_market_hours())
        .await
        .unwrap();

    steady(&queue, "X", dec!(42), 6).await;
    settle().await;

    assert_eq!(monitor.get_alerts().len(), 1);
    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_restarts_the_episode() {
    let monitor = monitor_with(TestMarket::new(), EngineConfig::default());
    let queue = monitor.add_channel_feed("primary").unwrap();
    monitor.configure("X", InstrumentConfig::new(dec!(0.1), 30)).await.unwrap();

    steady(&queue, "X", dec!(100.00), 20).await;
    monitor.configure("X", InstrumentConfig::new(dec!(0.1), 30)).await.unwrap();
    steady(&queue, "X", dec!(100.00), 15).await;
    settle().await;

    // t = 35s, but the timer restarted at t = 20s
    assert!(monitor.get_alerts().is_empty());

    steady(&queue, "X", dec!(100.00), 16).await;
    settle().await;
    assert_eq!(monitor.get_alerts().len(), 1);

    // Invalid update keeps the running configuration
    assert!(monitor.configure("X", InstrumentConfig::new(dec!(0), 30)).await.is_err());
    assert_eq!(monitor.config("X").unwrap().deviation, dec!(0.1));

    monitor.clear_alerts().await;
    assert!(monitor.get_alerts().is_empty());
    assert!(monitor.get_inactive_set().is_empty());
    assert!(monitor.config("X").is_some());

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_clear_alerts_rearms_flat_instrument() {
    let monitor = monitor_with(TestMarket::new(), EngineConfig::default());
    let queue = monitor.add_channel_feed("primary").unwrap();
    monitor.configure("X", InstrumentConfig::new(dec!(0.1), 30)).await.unwrap();

    steady(&queue, "X", dec!(100.00), 31).await;
    settle().await;
    assert_eq!(monitor.get_alerts().len(), 1);

    monitor.clear_alerts().await;
    settle().await;
    assert!(monitor.get_alerts().is_empty());
    assert!(monitor.get_inactive_set().is_empty());

    // Still flat after the clear: a fresh episode is reported
    steady(&queue, "X", dec!(100.00), 31).await;
    settle().await;
    assert_eq!(monitor.get_alerts().len(), 1);
    assert!(monitor.get_inactive_set().contains("X"));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_inactive_set_survives_movement_on_another_feed() {
    let monitor = monitor_with(TestMarket::new(), EngineConfig::default());
    let a = monitor.add_channel_feed("a").unwrap();
    let b = monitor.add_channel_feed("b").unwrap();
    monitor.configure("X", InstrumentConfig::new(dec!(0.1), 30)).await.unwrap();

    for _ in 0..31 {
        send(&a, "X", dec!(100.00)).await;
        send(&b, "X", dec!(100.00)).await;
        sleep(Duration::from_secs(1)).await;
    }
    settle().await;
    assert_eq!(monitor.get_alerts().len(), 2);
    assert!(monitor.get_inactive_set().contains("X"));

    // Feed b moves every 10s while feed a stays flat
    let mut b_price = dec!(100.00);
    for second in 0..120 {
        if second % 10 == 0 {
            b_price += dec!(0.5);
        }
        send(&a, "X", dec!(100.00)).await;
        send(&b, "X", b_price).await;
        sleep(Duration::from_secs(1)).await;
        settle().await;
        assert!(monitor.get_inactive_set().contains("X"), "cleared at {}s", second);
    }

    assert_eq!(monitor.get_alerts().len(), 2);

    // Once feed a moves too, nothing is inactive
    send(&a, "X", dec!(101.00)).await;
    settle().await;
    assert!(monitor.get_inactive_set().is_empty());

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unconfigured_instruments_are_not_monitored() {
    let monitor = monitor_with(TestMarket::new(), EngineConfig::default());
    let queue = monitor.add_channel_feed("primary").unwrap();
    let mut ticks = monitor.subscribe_ticks();

    steady(&queue, "Y", dec!(5), 40).await;
    settle().await;

    assert!(monitor.get_alerts().is_empty());
    assert_eq!(ticks.try_recv().unwrap().instrument, "Y");
    monitor.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_feed_names_rejected() {
    let monitor = InactivityMonitor::default();
    monitor.add_channel_feed("primary").unwrap();
    assert!(monitor.add_channel_feed("primary").is_err());
    assert!(monitor.add_channel_feed("").is_err());
    monitor.shutdown().await;
}

// Feed connector against a local event-stream server

const STREAM_HEADERS: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n";

/// Serve every connection with `body` and keep it open
async fn serve(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut request = vec![0u8; 4096];
                let _ = socket.read(&mut request).await;
                let _ = socket.write_all(STREAM_HEADERS.as_bytes()).await;
                let _ = socket.write_all(body.as_bytes()).await;
                let _ = socket.flush().await;
                sleep(Duration::from_secs(30)).await;
            });
        }
    });

    format!("http://{}/stream", addr)
}

#[tokio::test]
async fn test_connector_emits_valid_ticks_and_detects_freeze() {
    let url = serve(concat!(
        ": connected\n\n",
        "event: tick\n",
        "data: [{\"instrument_token\": 1, \"tradingsymbol\": \"INFY\", \"last_price\": 1500.5},",
        " {\"instrument_token\": 2, \"last_price\": {\"bad\": true}},",
        " {\"instrument_token\": 3, \"last_price\": 99, \"timestamp\": \"2025-08-14 10:00:00\"}]\n\n",
    ))
    .await;

    let config = FeedConfigBuilder::new("primary", &url)
        .idle_timeout(Duration::from_millis(300))
        .build();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = FeedConnector::new(config, tx).spawn();

    let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let ticks = match first {
        MonitorEvent::Ticks(ticks) => ticks,
        other => panic!("expected ticks, got {:?}", other),
    };
    assert_eq!(ticks.len(), 2);
    assert_eq!(ticks[0].instrument, "1");
    assert_eq!(ticks[0].last_price, dec!(1500.5));
    assert_eq!(ticks[1].exchange_timestamp.timestamp(), 1_755_145_800);

    let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(second, MonitorEvent::Frozen { since: Some(_) }));

    let status = handle.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert!(status.frozen);
    assert_eq!(status.ticks_emitted, 2);
    assert_eq!(status.count(DiagnosticKind::Parse), 1);
    assert_eq!(status.count(DiagnosticKind::Freeze), 1);
    assert_eq!(status.reconnect_attempts, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_connector_backs_off_when_unreachable() {
    // Reserve a port and release it so connections are refused
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/stream", listener.local_addr().unwrap());
    drop(listener);

    let config = FeedConfigBuilder::new("ancillary", &url)
        .connect_timeout(Duration::from_millis(500))
        .reconnect(ReconnectConfig {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(40),
        })
        .build();
    let (tx, _rx) = mpsc::channel(16);
    let handle = FeedConnector::new(config, tx).spawn();

    sleep(Duration::from_millis(400)).await;

    let status = handle.status();
    assert!(status.reconnect_attempts >= 2);
    assert!(status.count(DiagnosticKind::Connection) >= 2);
    assert_ne!(status.state, ConnectionState::Connected);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_non_success_status_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/stream", listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
                .await;
        }
    });

    let config = FeedConfigBuilder::new("primary", &url)
        .reconnect(ReconnectConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        })
        .build();
    let (tx, _rx) = mpsc::channel(16);
    let handle = FeedConnector::new(config, tx).spawn();

    sleep(Duration::from_millis(300)).await;

    let status = handle.status();
    assert_eq!(status.state, ConnectionState::Error);
    assert_eq!(status.reconnect_attempts, 1);
    assert!(status.diagnostics[0].message.contains("503"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_successful_open_resets_reconnect_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/stream", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut accepted = 0;
        while let Ok((mut socket, _)) = listener.accept().await {
            accepted += 1;
            let first_attempts = accepted <= 2;
            tokio::spawn(async move {
                let mut request = vec![0u8; 4096];
                let _ = socket.read(&mut request).await;
                if first_attempts {
                    let _ = socket
                        .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    return;
                }
                let _ = socket.write_all(STREAM_HEADERS.as_bytes()).await;
                let _ = socket
                    .write_all(b"event: tick\ndata: [{\"instrument_token\": 5, \"last_price\": 10}]\n\n")
                    .await;
                let _ = socket.flush().await;
                sleep(Duration::from_secs(30)).await;
            });
        }
    });

    let config = FeedConfigBuilder::new("primary", &url)
        .reconnect(ReconnectConfig {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(40),
        })
        .build();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = FeedConnector::new(config, tx).spawn();

    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, MonitorEvent::Ticks(_)));

    let status = handle.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.count(DiagnosticKind::Connection), 2);
    assert!(status.diagnostics.iter().any(|d| d.message.contains("503")));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_monitor_runs_network_feed() {
    let url = serve(concat!(
        "event: tick\n",
        "data: [{\"instrument_token\": 7, \"tradingsymbol\": \"TCS\", \"last_price\": 3100}]\n\n",
    ))
    .await;

    let monitor = InactivityMonitor::builder()
        .market_hours(TestMarket::new())
        .build();
    monitor
        .configure("7", InstrumentConfig::new(dec!(1), 1))
        .await
        .unwrap();
    monitor
        .add_feed(FeedConfigBuilder::new("primary", &url).build())
        .unwrap();

    let mut alerts = monitor.subscribe_alerts();
    let alert = timeout(Duration::from_secs(5), alerts.recv()).await.unwrap().unwrap();
    assert_eq!(alert.instrument, "7");
    assert_eq!(alert.name, "TCS");
    assert_eq!(alert.feed, "primary");

    assert!(monitor.feed_status("primary").is_some());
    assert!(monitor.feed_status("missing").is_none());

    monitor.shutdown().await;
}
