//! # logsink Engine
//!
//! Moves records from a partitioned log into a document store.
//!
//! This crate provides:
//! - Consumer loop state machine (fetch → decode → write → commit)
//! - Bounded exponential backoff with jitter for transient failures
//! - Dead-letter routing for permanent failures
//! - Monotonic per-partition offset tracking
//! - In-memory and file-backed log sources, document stores, dead-letter
//!   sinks and offset trackers
//!
//! ## Delivery Model
//!
//! The log delivers at least once and the store write is an idempotent
//! upsert keyed deterministically from the record, so re-delivery after a
//! crash converges on the same documents.
//!
//! ## Key Invariants
//!
//! - A partition's cursor never passes a record that was not durably
//!   persisted or durably dead-lettered
//! - Offsets of one partition are handled strictly in order
//! - A bad record never blocks the records behind it
//! - Failing to commit an offset stops the worker

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod consumer;
mod dead_letter;
mod dir;
mod error;
mod file_log;
mod file_store;
mod offset;
mod shutdown;
mod sink;
mod source;
mod store;

pub use config::{ConsumerConfig, RetryConfig, SinkConfig};
pub use consumer::{ConsumerLoop, ConsumerStats, LoopState, RunSummary, StopCause};
pub use dead_letter::{
    DeadLetterSink, FileDeadLetterSink, MemoryDeadLetterSink, VALUE_PREVIEW_LEN,
};
pub use dir::DataDir;
pub use error::{
    DeadLetterError, OffsetCommitError, PipelineError, PipelineResult, SourceError, SourceResult,
    StoreError, StoreResult, WriteError,
};
pub use file_log::{FileLog, FileLogAppender};
pub use file_store::{CompactionReport, FileDocumentStore};
pub use offset::{CommitOutcome, FileOffsetTracker, MemoryOffsetTracker, OffsetTracker};
pub use shutdown::ShutdownSignal;
pub use sink::{Ack, SinkStats, SinkWriter};
pub use source::{LogSource, MemoryLog};
pub use store::{seed_collection, DocumentStore, MemoryDocumentStore, UpsertOutcome};
