//! Kafka consumer service
//!
//! Runs a group component configured from the environment, logging every
//! batch it receives, until CTRL+C or SIGTERM.

use kafka_components::config::Config;
use kafka_components::kafka::LatestOffsetNotifier;
use kafka_components::models::Batch;
use kafka_components::{cancel_on_shutdown, logging, metrics, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

async fn log_batch(batch: Batch) -> anyhow::Result<()> {
    for message in batch.iter() {
        let _entered = message.span().enter();
        debug!(bytes = message.payload().len(), "Processing message");
    }
    info!(size = batch.len(), "Batch processed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;
    config.validate()?;

    logging::init_tracing(&config.service.log_level, &config.service.environment)?;
    config.log_config();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting kafka-components");

    if config.metrics.enabled {
        metrics::install_prometheus(config.metrics.address()?)?;
    }

    let (notifier, caught_up) = LatestOffsetNotifier::channel();
    let component = config
        .kafka
        .group_builder(&config.service.component_name)
        .processor(log_batch)
        .notify_on_latest_offset(notifier)
        .build()?;

    tokio::spawn(async move {
        if caught_up.await.is_ok() {
            info!("All partitions reached their startup offsets");
        }
    });

    let token = CancellationToken::new();
    let watcher = cancel_on_shutdown(token.clone());

    let result = component.run(token.clone()).await;
    token.cancel();
    let _ = watcher.await;

    result?;
    info!("kafka-components shutdown complete");
    Ok(())
}
