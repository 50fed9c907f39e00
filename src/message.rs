//! Billing version-difference message schema.
//!
//! Pure data contract for the events published by the billing comparison
//! pipeline. A message is deserialized only to validate its shape and pull
//! out the fields used for file naming; the durable record is always the raw
//! payload as received.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Routing event type used by the publishing side.
pub const EVENT_TYPE: &str = "billing.version.difference";

/// A detected difference between the locally known version of a bill and the
/// upstream one.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillVersionMessage {
    pub bill_id: String,
    pub period: String,
    #[serde(default)]
    pub mo_id: String,
    /// Locally known version token, e.g. `17246554` (fixed 8 characters).
    /// Absent when the bill had no local version yet.
    #[serde(default)]
    pub previous_version: Option<String>,
    /// Upstream version token, same format.
    pub current_version: String,
    #[serde(default)]
    pub difference_detected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub change_type: VersionChangeType,
    /// Free-form context attached by the publisher.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Kind of version change that was detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionChangeType {
    #[default]
    NoChange,
    VersionUpdated,
    /// The bill had no local version at all.
    NewVersion,
    /// The version is gone from the upstream data.
    VersionRemoved,
}
