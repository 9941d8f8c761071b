//! Records set aside after a permanent failure.

use crate::record::{LogRecord, SourcePosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Why a record was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// The payload could not be decoded.
    MalformedPayload,
    /// The store rejected the document (validation or constraint).
    StoreRejected,
    /// The store refused the credentials.
    Unauthorized,
    /// Transient failures outlasted the retry budget.
    RetriesExhausted,
}

impl FailureReason {
    /// Stable label used in logs and dumps.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::MalformedPayload => "malformed-payload",
            FailureReason::StoreRejected => "store-rejected",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::RetriesExhausted => "retries-exhausted",
        }
    }

    /// Returns true if the reason points at the store rather than the record.
    #[must_use]
    pub fn is_store_side(self) -> bool {
        matches!(
            self,
            FailureReason::Unauthorized | FailureReason::RetriesExhausted
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is left of a record value that was cut down to a preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedValue {
    /// Length of the original value in bytes.
    pub original_len: u64,
    /// CRC-32 of the original value.
    pub crc32: u32,
}

/// A record that will not be ingested automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Unique identifier of this dead letter.
    pub id: Uuid,
    /// The original record, untouched unless `truncated` is set.
    pub record: LogRecord,
    /// Failure reason.
    pub reason: FailureReason,
    /// Human-readable description of the last failure.
    pub detail: String,
    /// When handling of the record started.
    pub first_seen: DateTime<Utc>,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// When the record was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
    /// Set when `record.value` only holds a prefix of the original value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<TruncatedValue>,
}

impl DeadLetterRecord {
    /// Creates a dead letter stamped now.
    pub fn new(
        record: LogRecord,
        reason: FailureReason,
        detail: impl Into<String>,
        first_seen: DateTime<Utc>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            record,
            reason,
            detail: detail.into(),
            first_seen,
            attempts,
            dead_lettered_at: Utc::now(),
            truncated: None,
        }
    }

    /// Cuts the record key and value down to `keep` bytes each.
    ///
    /// `crc32` is the checksum of the full value; it is kept together with
    /// the original length so the value can still be matched against the
    /// log. The detail is bounded the same way and notes the truncation.
    #[must_use]
    pub fn into_preview(mut self, keep: usize, crc32: u32) -> Self {
        let original_len = self.record.value.len();
        if let Some(key) = self.record.key.as_mut() {
            key.truncate(keep);
        }
        if self.detail.len() > keep {
            let mut end = keep;
            while !self.detail.is_char_boundary(end) {
                end -= 1;
            }
            self.detail.truncate(end);
        }
        if original_len > keep {
            self.record.value.truncate(keep);
            self.truncated = Some(TruncatedValue {
                original_len: original_len as u64,
                crc32,
            });
            self.detail = format!(
                "{} (value truncated from {original_len} to {keep} bytes)",
                self.detail
            );
        }
        self
    }

    /// Position of the original record.
    #[must_use]
    pub fn position(&self) -> SourcePosition {
        self.record.position()
    }
}
