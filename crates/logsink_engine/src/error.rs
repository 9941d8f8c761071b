//! Error types for the pipeline.
//!
//! Record-level failures ([`StoreError`], [`WriteError`], [`SourceError`],
//! [`DeadLetterError`]) implement [`Classify`] so the consumer loop can decide
//! between retrying and dead-lettering. [`PipelineError`] is what stops a
//! worker.

use logsink_model::{Classify, ErrorClass, FailureReason, PartitionId};
use logsink_storage::StorageError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for document store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for log source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Result type for running a pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors reported by a document store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store cannot be reached or is not accepting writes.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete in time.
    #[error("store operation timed out: {0}")]
    Timeout(String),

    /// The document failed validation or violated a constraint.
    #[error("document rejected: {0}")]
    Rejected(String),

    /// The credentials were refused.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Any other store error, with the server code if there was one.
    #[error("store error (code {code:?}): {message}")]
    Other {
        /// Server error code.
        code: Option<i32>,
        /// Error message.
        message: String,
    },

    /// The local storage layer failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A document could not be encoded or decoded.
    #[error("document encoding error: {0}")]
    Encoding(String),
}

impl StoreError {
    /// Maps a document-database server error code to a store error.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            // BadValue, TypeMismatch, DuplicateKey, DocumentValidationFailure
            2 | 14 | 11000 | 121 => StoreError::Rejected(message),
            // Unauthorized, AuthenticationFailed
            13 | 18 => StoreError::Unauthorized(message),
            // MaxTimeMSExpired, NetworkTimeout, ExceededTimeLimit
            50 | 89 | 262 => StoreError::Timeout(message),
            // host unreachable/not found, shutdown, elections, not primary
            6 | 7 | 91 | 189 | 10107 | 11600 | 11602 | 13435 | 13436 => {
                StoreError::Unavailable(message)
            }
            _ => StoreError::Other {
                code: Some(code),
                message,
            },
        }
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::Other { .. } => {
                ErrorClass::Transient
            }
            StoreError::Rejected(_) | StoreError::Unauthorized(_) | StoreError::Encoding(_) => {
                ErrorClass::Permanent
            }
            StoreError::Storage(e) => storage_class(e),
        }
    }
}

/// Outcome of a failed persist, already classified.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Retrying may succeed.
    #[error("transient write failure: {0}")]
    Transient(#[source] StoreError),

    /// Retrying will not help.
    #[error("permanent write failure: {0}")]
    Permanent(#[source] StoreError),
}

impl WriteError {
    /// Wraps a store error according to its class.
    pub fn from_store(error: StoreError) -> Self {
        match error.class() {
            ErrorClass::Transient => WriteError::Transient(error),
            ErrorClass::Permanent => WriteError::Permanent(error),
        }
    }

    /// The underlying store error.
    pub fn store_error(&self) -> &StoreError {
        match self {
            WriteError::Transient(e) | WriteError::Permanent(e) => e,
        }
    }

    /// Dead-letter reason if this failure ends the record's handling.
    pub fn reason(&self) -> FailureReason {
        match self {
            WriteError::Transient(_) => FailureReason::RetriesExhausted,
            WriteError::Permanent(StoreError::Unauthorized(_)) => FailureReason::Unauthorized,
            WriteError::Permanent(_) => FailureReason::StoreRejected,
        }
    }
}

impl Classify for WriteError {
    fn class(&self) -> ErrorClass {
        match self {
            WriteError::Transient(_) => ErrorClass::Transient,
            WriteError::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// Errors reported by a log source.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The log cannot be reached.
    #[error("log unavailable: {0}")]
    Unavailable(String),

    /// A request to the log timed out.
    #[error("log request timed out")]
    Timeout,

    /// Reading the log is not permitted.
    #[error("not authorized to read the log: {0}")]
    Unauthorized(String),

    /// The local log files failed.
    #[error("log storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored record could not be decoded.
    #[error("log record encoding error: {0}")]
    Encoding(String),

    /// The topic name cannot be used as a file name.
    #[error("invalid topic name `{0}`")]
    InvalidTopic(String),
}

impl Classify for SourceError {
    fn class(&self) -> ErrorClass {
        match self {
            SourceError::Unavailable(_) | SourceError::Timeout => ErrorClass::Transient,
            SourceError::Unauthorized(_)
            | SourceError::Encoding(_)
            | SourceError::InvalidTopic(_) => ErrorClass::Permanent,
            SourceError::Storage(e) => storage_class(e),
        }
    }
}

/// Errors reported by a dead-letter sink.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    /// The sink cannot accept records right now.
    #[error("dead-letter sink unavailable: {0}")]
    Unavailable(String),

    /// The journal files failed.
    #[error("dead-letter storage error: {0}")]
    Storage(#[from] StorageError),

    /// A dead letter could not be encoded or decoded.
    #[error("dead-letter encoding error: {0}")]
    Encoding(String),
}

impl Classify for DeadLetterError {
    fn class(&self) -> ErrorClass {
        match self {
            DeadLetterError::Unavailable(_) => ErrorClass::Transient,
            DeadLetterError::Encoding(_) => ErrorClass::Permanent,
            DeadLetterError::Storage(e) => storage_class(e),
        }
    }
}

/// Errors reported by an offset tracker. Always fatal to the worker.
#[derive(Error, Debug)]
pub enum OffsetCommitError {
    /// Reading or writing a cursor file failed.
    #[error("cursor storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cursor I/O failed.
    #[error("cursor I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored cursor could not be decoded.
    #[error("cursor for partition {partition} is unreadable: {message}")]
    Corrupt {
        /// Partition whose cursor is damaged.
        partition: PartitionId,
        /// Decoder message.
        message: String,
    },

    /// The cursor store refused the operation.
    #[error("cursor store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that stop a pipeline worker.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The starting cursor could not be read.
    #[error("failed to load cursor for partition {partition}: {source}")]
    CursorLoad {
        /// Partition being started.
        partition: PartitionId,
        /// Tracker error.
        #[source]
        source: OffsetCommitError,
    },

    /// Committing an offset failed.
    #[error("failed to commit offset {offset} on partition {partition}: {source}")]
    Commit {
        /// Partition being committed.
        partition: PartitionId,
        /// Offset that could not be committed.
        offset: u64,
        /// Tracker error.
        #[source]
        source: OffsetCommitError,
    },

    /// The log stayed unreachable past the reconnect budget.
    #[error("log unavailable on partition {partition} after {attempts} attempts: {source}")]
    SourceUnavailable {
        /// Partition being read.
        partition: PartitionId,
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        #[source]
        source: SourceError,
    },

    /// The log returned a permanent error.
    #[error("log error on partition {partition}: {source}")]
    Source {
        /// Partition being read.
        partition: PartitionId,
        /// The error.
        #[source]
        source: SourceError,
    },

    /// Too many consecutive records failed at the store.
    #[error(
        "store unavailable: {consecutive} consecutive records dead-lettered on partition {partition}"
    )]
    StoreUnavailable {
        /// Partition being written.
        partition: PartitionId,
        /// Length of the failure streak.
        consecutive: u32,
    },

    /// A dead letter could not be written, so its offset cannot be committed.
    #[error(
        "dead-letter sink failed for offset {offset} on partition {partition} after {attempts} attempts: {source}"
    )]
    DeadLetter {
        /// Partition being handled.
        partition: PartitionId,
        /// Offset of the record.
        offset: u64,
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        #[source]
        source: DeadLetterError,
    },

    /// Another process owns the data directory.
    #[error("data directory {} is locked by another process", .0.display())]
    DirectoryLocked(PathBuf),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error while preparing the pipeline.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Partition the error belongs to, if any.
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            PipelineError::CursorLoad { partition, .. }
            | PipelineError::Commit { partition, .. }
            | PipelineError::SourceUnavailable { partition, .. }
            | PipelineError::Source { partition, .. }
            | PipelineError::StoreUnavailable { partition, .. }
            | PipelineError::DeadLetter { partition, .. } => Some(*partition),
            PipelineError::DirectoryLocked(_) | PipelineError::Config(_) | PipelineError::Io(_) => {
                None
            }
        }
    }
}

fn storage_class(error: &StorageError) -> ErrorClass {
    match error {
        StorageError::Io(e) => e.class(),
        StorageError::Corrupted { .. }
        | StorageError::FrameTooLarge { .. }
        | StorageError::Poisoned { .. } => ErrorClass::Permanent,
    }
}
