//! billing-consumer: RabbitMQ to disk persistence daemon.
//!
//! Consumes billing version-difference events and writes each verbatim
//! payload to the configured output directory, acknowledging a message only
//! after its file is written.
//!
//! ## Configuration
//! - `config.yaml` in the working directory, or a path given as the first
//!   argument
//! - `BILLING_CONFIG`: alternative configuration file path
//! - `BILLING__BROKER__HOST` etc.: environment overrides
//! - `BILLING_LOG`: tracing filter (default: info)

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use billing_consumer::config::{Config, LOG_ENV_VAR};
use billing_consumer::logging::BestEffortLog;
use billing_consumer::service::ConsumerService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let mut service = ConsumerService::start(&config, BestEffortLog::default())
        .await
        .map_err(|e| {
            error!("Fatal error during startup: {}", e);
            e
        })?;

    info!("Consumer running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Ctrl+C received, shutting down");
    service.stop().await;

    Ok(())
}
