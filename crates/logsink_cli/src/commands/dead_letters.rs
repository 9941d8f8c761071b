//! Dead-letters command implementation.

use crate::settings::Settings;
use chrono::{DateTime, Utc};
use logsink_engine::{DataDir, FileDeadLetterSink};
use logsink_model::{DeadLetterRecord, PartitionId, TruncatedValue};
use serde::Serialize;

/// One dead letter as printed.
#[derive(Debug, Serialize)]
pub struct DeadLetterLine {
    /// Dead-letter id.
    pub id: String,
    /// Partition of the record.
    pub partition: u32,
    /// Offset of the record.
    pub offset: u64,
    /// Failure category.
    pub reason: &'static str,
    /// Last failure message.
    pub detail: String,
    /// Attempts made.
    pub attempts: u32,
    /// When handling started.
    pub first_seen: DateTime<Utc>,
    /// When the record was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
    /// Record key, lossily decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Record payload, lossily decoded.
    pub value: String,
    /// Set when `value` is only a prefix of the record payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<TruncatedValue>,
}

impl From<&DeadLetterRecord> for DeadLetterLine {
    fn from(letter: &DeadLetterRecord) -> Self {
        Self {
            id: letter.id.to_string(),
            partition: letter.record.partition.get(),
            offset: letter.record.offset,
            reason: letter.reason.as_str(),
            detail: letter.detail.clone(),
            attempts: letter.attempts,
            first_seen: letter.first_seen,
            dead_lettered_at: letter.dead_lettered_at,
            key: letter
                .record
                .key
                .as_ref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            value: String::from_utf8_lossy(&letter.record.value).into_owned(),
            truncated: letter.truncated,
        }
    }
}

/// Prints dead letters as JSON lines, oldest first per partition.
pub fn run(
    settings: &Settings,
    partition: Option<u32>,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = DataDir::open(&settings.store.path, true)?;
    let sink = FileDeadLetterSink::open(&dir.dead_letters_dir())?;

    let letters = sink.read(partition.map(PartitionId))?;
    for letter in letters.iter().take(limit.unwrap_or(usize::MAX)) {
        println!("{}", serde_json::to_string(&DeadLetterLine::from(letter))?);
    }
    Ok(())
}
