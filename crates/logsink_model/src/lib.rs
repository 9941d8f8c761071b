//! # logsink Model
//!
//! The data that flows through a logsink pipeline, and the pure functions
//! that shape it.
//!
//! This crate provides:
//! - [`LogRecord`]: an immutable record read from one log partition
//! - [`decode`]: raw payload bytes to a validated [`DecodedEvent`]
//! - [`PersistedDocument`] and [`DocumentKey`]: the store-side form of an event
//! - [`CommitCursor`]: the last offset safely handled in a partition
//! - [`DeadLetterRecord`]: a record set aside for manual inspection
//! - [`ErrorClass`] and [`Classify`]: the transient/permanent split that
//!   drives retry decisions
//!
//! Nothing here performs I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod class;
mod cursor;
mod dead_letter;
mod decoder;
mod document;
mod event;
mod record;

pub use class::{classify, Classify, ErrorClass};
pub use cursor::CommitCursor;
pub use dead_letter::{DeadLetterRecord, FailureReason, TruncatedValue};
pub use decoder::{decode, DecodeError};
pub use document::{DocumentKey, KeyStrategy, PersistedDocument};
pub use event::{DecodedEvent, EVENT_NAMES, SEED_EVENT_ID, SEED_EVENT_NAME};
pub use record::{LogRecord, PartitionId, SourcePosition};
