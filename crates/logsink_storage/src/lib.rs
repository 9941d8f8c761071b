//! # logsink Storage
//!
//! Append-only record files for logsink.
//!
//! Every durable structure in logsink (the local partition log, the document
//! log, the dead-letter journal) is a sequence of checksummed frames in a
//! plain file. This crate owns the frame format and nothing else: payloads
//! are opaque bytes and their encoding belongs to the callers.
//!
//! ## Frame Format
//!
//! ```text
//! ┌───────────┬────────────┬─────────────────┬────────────┐
//! │ "LSRF"    │ len u32 LE │ payload (len)   │ crc32 LE   │
//! └───────────┴────────────┴─────────────────┴────────────┘
//! ```
//!
//! The checksum covers the length field and the payload.
//!
//! ## Available Types
//!
//! - [`RecordFile`] - single writer, recovers a torn tail on open
//! - [`RecordReader`] - read-only tailing of a file another process appends to
//! - [`write_atomic`] - crash-safe whole-file replacement
//!
//! ## Example
//!
//! ```rust,no_run
//! use logsink_storage::RecordFile;
//! use std::path::Path;
//!
//! let file = RecordFile::open(Path::new("events.log")).unwrap();
//! file.append(b"hello").unwrap();
//! file.sync().unwrap();
//!
//! let scan = file.scan_from(0).unwrap();
//! assert_eq!(scan.frames[0].payload, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod atomic;
mod checksum;
mod error;
mod file;
mod frame;

pub use atomic::{sync_directory, write_atomic};
pub use checksum::compute_crc32;
pub use error::{StorageError, StorageResult};
pub use file::{Frame, RecordFile, RecordReader, Scan};
pub use frame::{
    decode_frame, encode_frame, FrameRead, FRAME_HEADER_SIZE, FRAME_MAGIC, FRAME_OVERHEAD,
    MAX_FRAME_PAYLOAD,
};
