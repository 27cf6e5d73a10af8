use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{error, info};

use deribit_relay::server::{run_server, ServerState};
use deribit_relay::shutdown::wait_for_stop;
use deribit_relay::{Config, LogFormat, Metrics, Orchestrator};

const DEFAULT_LOG_FILTER: &str =
    "deribit_relay=info,relay_gateway=info,relay_cache=info,relay_distribution=info";

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_format);
    config.validate()?;

    info!(
        network = config.network(),
        instruments = %config.instruments,
        currency = %config.currency,
        book_depth = config.book_depth,
        authenticated = config.credentials().is_some(),
        "deribit-relay starting"
    );

    let relay = Arc::new(
        Orchestrator::start(&config)
            .await
            .context("failed to start relay")?,
    );

    let metrics = Arc::new(Metrics::new().context("failed to build metrics registry")?);
    let state = ServerState::new(relay.clone(), metrics, relay.latency());
    let listener = tokio::net::TcpListener::bind(&config.health_addr)
        .await
        .with_context(|| format!("failed to bind health listener on {}", config.health_addr))?;
    let (health_stop, health_stopped) = oneshot::channel::<()>();
    let health = tokio::spawn(run_server(listener, state, async move {
        let _ = health_stopped.await;
    }));

    wait_for_stop(config.run_for_secs.map(Duration::from_secs)).await;

    relay.shutdown().await;
    let _ = health_stop.send(());
    match health.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "health server failed"),
        Err(e) => error!(error = %e, "health server task failed"),
    }

    info!("deribit-relay stopped");
    Ok(())
}
