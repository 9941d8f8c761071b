//! Records read from a partitioned log.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one partition of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Returns the raw partition number.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// A position in the log: partition plus partition-relative offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Partition the record came from.
    pub partition: PartitionId,
    /// Offset within the partition.
    pub offset: u64,
}

impl SourcePosition {
    /// Creates a position.
    #[must_use]
    pub fn new(partition: PartitionId, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}@{}", self.partition, self.offset)
    }
}

/// One record of a log partition.
///
/// Records are immutable once read. Key and value are opaque bytes; only
/// the decoder gives the value meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Partition the record belongs to.
    pub partition: PartitionId,
    /// Offset within the partition, strictly increasing.
    pub offset: u64,
    /// Optional record key.
    pub key: Option<Bytes>,
    /// Record payload.
    pub value: Bytes,
    /// When the log accepted the record.
    pub enqueued_at: DateTime<Utc>,
}

impl LogRecord {
    /// Creates a keyless record enqueued now.
    pub fn new(partition: PartitionId, offset: u64, value: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: value.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Sets the record key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the enqueue time.
    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = at;
        self
    }

    /// Returns where this record lives in the log.
    #[must_use]
    pub fn position(&self) -> SourcePosition {
        SourcePosition::new(self.partition, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_display() {
        let record = LogRecord::new(PartitionId(3), 42, &b"{}"[..]);
        assert_eq!(record.position().to_string(), "p3@42");
    }

    #[test]
    fn builder_sets_key() {
        let record = LogRecord::new(PartitionId(0), 0, &b"v"[..]).with_key(&b"k"[..]);
        assert_eq!(record.key.as_deref(), Some(&b"k"[..]));
        assert_eq!(record.value.as_ref(), b"v");
    }
}
