//! Consumer service lifecycle.
//!
//! The host-facing surface: `start` wires the persistence sink to the broker
//! session and begins consumption, `stop` tears the session down. Startup is
//! all-or-nothing: any initialization fault propagates so the process never
//! runs half-initialized.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::broker::{BrokerError, BrokerSession};
use crate::config::Config;
use crate::logging::BestEffortLog;
use crate::persistence::FileStore;

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Output directory unusable: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Running consumer: a broker session feeding the file store.
pub struct ConsumerService {
    session: Option<BrokerSession>,
    log: BestEffortLog,
}

impl ConsumerService {
    /// Initialize the sink and broker session and begin consuming.
    pub async fn start(config: &Config, log: BestEffortLog) -> Result<Self, StartupError> {
        let store = FileStore::new(&config.storage.output_dir, log.clone()).await?;

        let session = BrokerSession::connect(config.broker.clone(), log.clone()).await?;
        session.start_consuming(Arc::new(store)).await?;

        log.record("Consumer started");
        info!(
            queue = %config.broker.queue,
            output_dir = %config.storage.output_dir.display(),
            "Consumer service started"
        );

        Ok(Self {
            session: Some(session),
            log,
        })
    }

    /// Stop consuming and release broker resources. Idempotent; an in-flight
    /// handler is allowed to finish naturally.
    pub async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            self.log.record("Stopping consumer...");
            session.close().await;
        }
    }
}
