//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A complete frame failed validation.
    #[error("corrupted frame at byte {position}: {reason}")]
    Corrupted {
        /// Byte position of the frame start.
        position: u64,
        /// What failed.
        reason: String,
    },

    /// A payload exceeds the frame size limit.
    #[error("payload of {len} bytes exceeds the frame limit of {max} bytes")]
    FrameTooLarge {
        /// Payload length.
        len: usize,
        /// Maximum allowed payload length.
        max: usize,
    },

    /// An earlier append failed and could not be rolled back.
    #[error("record file {} needs to be reopened after a failed append", path.display())]
    Poisoned {
        /// File path.
        path: PathBuf,
    },
}

impl StorageError {
    /// Creates a corruption error for the frame starting at `position`.
    pub fn corrupted(position: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            position,
            reason: reason.into(),
        }
    }

    /// Returns true if the error reports damaged on-disk data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corrupted { .. })
    }
}
