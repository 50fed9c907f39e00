//! Storage configuration types.

use std::path::PathBuf;

use serde::Deserialize;

/// Persistence target settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory where incoming payloads are written, one file per message.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("input_messages"),
        }
    }
}
