use std::sync::Arc;

use anyhow::Context;
use cosync_relay::{
    app::shutdown_signal,
    build_registry,
    config::RelayConfig,
    metrics::{set_global_metrics, RelayMetrics},
    serve,
    ws::ConnectionSettings,
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    set_global_metrics(Arc::new(RelayMetrics::default()));

    let registry = build_registry(&config).context("failed to initialize document stores")?;
    let settings = ConnectionSettings { ping_interval: config.ping_interval };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        ping_interval_ms = config.ping_interval.as_millis() as u64,
        persist_wait_ms = config.persist.wait.as_millis() as u64,
        persist_max_wait_ms = config.persist.max_wait.as_millis() as u64,
        gc = config.gc,
        "starting relay server"
    );

    serve(listener, registry, settings, shutdown_signal()).await
}
