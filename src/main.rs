use anyhow::Context;
use inactivity_monitor::{config::AppConfig, init_logging, InactivityMonitor, TracingObserver};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = AppConfig::from_env().context("loading configuration")?;
    tracing::info!(
        "Monitoring {} instruments across {} feeds",
        config.instruments.len(),
        config.feeds.len()
    );

    let monitor = InactivityMonitor::builder()
        .observer(Arc::new(TracingObserver))
        .build();

    for (instrument, instrument_config) in config.instruments {
        monitor
            .configure(&instrument, instrument_config)
            .await
            .with_context(|| format!("configuring {}", instrument))?;
    }

    for feed in config.feeds {
        let name = feed.name.clone();
        monitor
            .add_feed(feed)
            .with_context(|| format!("starting feed {}", name))?;
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutting down");

    monitor.shutdown().await;
    Ok(())
}
