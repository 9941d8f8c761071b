//! Sink writer: decoded events to idempotent upserts.

use crate::config::SinkConfig;
use crate::error::WriteError;
use crate::store::{DocumentStore, UpsertOutcome};
use logsink_model::{Classify, DecodedEvent, DocumentKey, PersistedDocument, SourcePosition};
use parking_lot::RwLock;

/// Acknowledgement of a durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Key the document was stored under.
    pub key: DocumentKey,
    /// Whether the write created or replaced the document.
    pub outcome: UpsertOutcome,
    /// Log position of the record written.
    pub position: SourcePosition,
}

/// Running counters of a sink writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Successful writes.
    pub persisted: u64,
    /// Writes that created a document.
    pub inserted: u64,
    /// Writes that replaced a document.
    pub replaced: u64,
    /// Writes that failed transiently.
    pub transient_failures: u64,
    /// Writes that failed permanently.
    pub permanent_failures: u64,
}

/// Applies decoded events to a document store.
pub struct SinkWriter<S: DocumentStore> {
    store: S,
    config: SinkConfig,
    stats: RwLock<SinkStats>,
}

impl<S: DocumentStore> SinkWriter<S> {
    /// Creates a writer over `store`.
    pub fn new(store: S, config: SinkConfig) -> Self {
        Self {
            store,
            config,
            stats: RwLock::new(SinkStats::default()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The writer configuration.
    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SinkStats {
        self.stats.read().clone()
    }

    /// Upserts `event`, read at `position`, under its deterministic key.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Transient`] for failures worth retrying and
    /// [`WriteError::Permanent`] for rejections.
    pub fn persist(&self, event: &DecodedEvent, position: SourcePosition) -> Result<Ack, WriteError> {
        let document = PersistedDocument::from_event(event, position, self.config.key_strategy);

        match self.store.upsert(&self.config.collection, &document) {
            Ok(outcome) => {
                let mut stats = self.stats.write();
                stats.persisted += 1;
                match outcome {
                    UpsertOutcome::Inserted => stats.inserted += 1,
                    UpsertOutcome::Replaced => stats.replaced += 1,
                }
                Ok(Ack {
                    key: document.key,
                    outcome,
                    position,
                })
            }
            Err(err) => {
                let err = WriteError::from_store(err);
                let mut stats = self.stats.write();
                if err.is_transient() {
                    stats.transient_failures += 1;
                } else {
                    stats.permanent_failures += 1;
                }
                Err(err)
            }
        }
    }
}
