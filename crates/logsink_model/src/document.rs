//! Store-side documents and their keys.

use crate::event::{DecodedEvent, SEED_EVENT_ID, SEED_EVENT_NAME};
use crate::record::SourcePosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Deterministic key of a persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Wraps an existing key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a document key is derived from an event.
///
/// Either way the same record always maps to the same key, which is what
/// makes re-delivery harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// `event-<id>`: events sharing an identifier converge on one document.
    #[default]
    EventId,
    /// `event-<id>-p<partition>-o<offset>`: for producers whose identifiers
    /// are not unique.
    EventIdAndOffset,
}

impl KeyStrategy {
    /// Derives the key for `event` read at `position`.
    #[must_use]
    pub fn key_for(self, event: &DecodedEvent, position: SourcePosition) -> DocumentKey {
        match self {
            KeyStrategy::EventId => DocumentKey(format!("event-{}", event.id)),
            KeyStrategy::EventIdAndOffset => DocumentKey(format!(
                "event-{}-p{}-o{}",
                event.id, position.partition, position.offset
            )),
        }
    }

    /// Configuration name of the strategy.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStrategy::EventId => "event-id",
            KeyStrategy::EventIdAndOffset => "event-id-and-offset",
        }
    }
}

impl FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event-id" => Ok(KeyStrategy::EventId),
            "event-id-and-offset" => Ok(KeyStrategy::EventIdAndOffset),
            other => Err(format!(
                "unknown key strategy `{other}` (expected `event-id` or `event-id-and-offset`)"
            )),
        }
    }
}

/// An event as stored in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDocument {
    /// Document key.
    pub key: DocumentKey,
    /// Event identifier.
    pub id: i64,
    /// Event name.
    pub name: String,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Log position that last wrote this document, if it came from the log.
    pub source: Option<SourcePosition>,
}

impl PersistedDocument {
    /// Builds the document for `event` read at `position`.
    #[must_use]
    pub fn from_event(event: &DecodedEvent, position: SourcePosition, strategy: KeyStrategy) -> Self {
        Self {
            key: strategy.key_for(event, position),
            id: event.id,
            name: event.name.clone(),
            timestamp: event.timestamp,
            source: Some(position),
        }
    }

    /// The bootstrap document a fresh collection is seeded with.
    #[must_use]
    pub fn seed(at: DateTime<Utc>) -> Self {
        Self {
            key: DocumentKey(format!("event-{SEED_EVENT_ID}")),
            id: SEED_EVENT_ID,
            name: SEED_EVENT_NAME.to_owned(),
            timestamp: at,
            source: None,
        }
    }

    /// Returns the event fields of this document.
    #[must_use]
    pub fn event(&self) -> DecodedEvent {
        DecodedEvent::new(self.id, self.name.clone(), self.timestamp)
    }
}
