//! File-backed persistence of raw message payloads.
//!
//! Each accepted message becomes one file under the output directory:
//! `Bill_{billId}_Per_{period}_V{currentVersion}_{yyyyMMdd_HHmm_ssfff}.json`.
//! The content is the payload exactly as received, independent of how much of
//! the schema matched, so the durable record keeps byte-for-byte fidelity.
//!
//! The public save operation is total: every failure (parse, permissions,
//! disk full) is logged and reported as `false`, never raised, so the caller
//! can decide the broker disposition without fault handling of its own.

use std::path::{Path, PathBuf};

use chrono::Local;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::broker::{MessageHandler, Result as BrokerResult};
use crate::logging::BestEffortLog;
use crate::message::BillVersionMessage;

/// Timestamp layout for generated file names, millisecond precision.
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M_%S%3f";

/// Attempts at a unique name before giving up on same-millisecond collisions.
const NAME_ATTEMPTS: u32 = 3;

/// Errors that can occur while persisting a payload. Internal to the sink;
/// the public boundary reports them as `false`.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Malformed payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not produce a unique file name for bill {0}")]
    NameCollision(String),
}

/// File store for raw bill version messages.
#[derive(Clone)]
pub struct FileStore {
    output_dir: PathBuf,
    log: BestEffortLog,
}

impl FileStore {
    /// Create the store, ensuring the output directory exists.
    ///
    /// A failure here is fatal: the consumer must not start without a
    /// writable target directory.
    pub async fn new(output_dir: impl AsRef<Path>, log: BestEffortLog) -> std::io::Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir).await?;
        Ok(Self { output_dir, log })
    }

    /// Persist one raw payload, returning `true` on success.
    pub async fn save_message(&self, raw: &str) -> bool {
        match self.try_save(raw).await {
            Ok(name) => {
                self.log.record(&format!("Stored {}", name));
                debug!(file = %name, bytes = raw.len(), "Persisted payload");
                true
            }
            Err(e) => {
                self.log.record(&format!("Failed to store message: {}", e));
                error!(error = %e, "Failed to persist payload");
                false
            }
        }
    }

    async fn try_save(&self, raw: &str) -> Result<String, PersistError> {
        // Parsed only to validate the shape and extract the naming fields;
        // the stored artifact is the payload exactly as received.
        let message: BillVersionMessage = serde_json::from_str(raw)?;

        for _ in 0..NAME_ATTEMPTS {
            let timestamp = Local::now().format(TIMESTAMP_FORMAT);
            let name = format!(
                "Bill_{}_Per_{}_V{}_{}.json",
                message.bill_id, message.period, message.current_version, timestamp
            );
            let path = self.output_dir.join(&name);

            // create_new keeps writers exclusive; a second delivery for the
            // same bill/period/version within one millisecond lands on the
            // next attempt with a fresh timestamp.
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(raw.as_bytes()).await?;
                    file.flush().await?;
                    return Ok(name);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PersistError::NameCollision(message.bill_id))
    }
}

impl MessageHandler for FileStore {
    fn handle(&self, payload: String) -> BoxFuture<'static, BrokerResult<bool>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.save_message(&payload).await) })
    }
}
