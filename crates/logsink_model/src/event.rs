//! The structured event carried by each record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Names the event generator draws from.
pub const EVENT_NAMES: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

/// Identifier of the document written when a collection is seeded.
pub const SEED_EVENT_ID: i64 = 0;

/// Name of the document written when a collection is seeded.
pub const SEED_EVENT_NAME: &str = "init";

/// A fully validated event.
///
/// Every field is present and well-typed; partially valid payloads never
/// become a `DecodedEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Producer-assigned identifier.
    pub id: i64,
    /// Event name.
    pub name: String,
    /// When the producer created the event.
    pub timestamp: DateTime<Utc>,
}

impl DecodedEvent {
    /// Creates an event.
    pub fn new(id: i64, name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            timestamp,
        }
    }

    /// Encodes the event as the JSON payload producers write to the log.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
