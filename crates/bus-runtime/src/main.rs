//! # Integration Bus Host
//!
//! Runs the ordering service's integration bus against RabbitMQ until Ctrl-C.

use anyhow::{Context, Result};
use bus_runtime::{BusRuntime, RuntimeConfig};
use bus_telemetry::init_telemetry;
use shared_bus::AmqpConnectionManager;
use tracing::{info, warn};

/// Order id used by the demo publish.
const DEMO_ORDER_ID: u64 = 123;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env().context("loading configuration")?;

    // Held until exit so buffered spans are flushed.
    let _telemetry = init_telemetry(config.telemetry.clone()).context("initializing telemetry")?;

    info!("===========================================");
    info!("  Integration Bus Runtime v{}", env!("CARGO_PKG_VERSION"));
    info!("  Client: {}", config.bus.subscription_client_name);
    info!("===========================================");

    let manager = AmqpConnectionManager::connect(&config.connection_uri, config.bus.retry_policy())
        .await
        .context("connecting to broker")?;

    let runtime = BusRuntime::new(manager.connection(), config.bus.clone());
    runtime.start().await?;

    if config.demo_publish {
        if let Err(e) = runtime.publish_demo(DEMO_ORDER_ID).await {
            warn!(error = %e, "Demo publish failed");
        }
    }

    info!("Bus is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    if let Err(e) = runtime.shutdown().await {
        warn!(error = %e, "Event bus did not shut down cleanly");
    }
    manager.close().await.context("closing broker connection")?;

    Ok(())
}
