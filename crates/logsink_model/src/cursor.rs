//! Per-partition commit cursor.

use crate::record::PartitionId;
use serde::{Deserialize, Serialize};

/// The highest offset of a partition whose record has been durably
/// persisted or durably dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCursor {
    /// Partition the cursor tracks.
    pub partition: PartitionId,
    /// Last offset safely handled.
    pub last_safe_offset: u64,
}

impl CommitCursor {
    /// Creates a cursor.
    #[must_use]
    pub fn new(partition: PartitionId, last_safe_offset: u64) -> Self {
        Self {
            partition,
            last_safe_offset,
        }
    }

    /// Offset to resume consumption from.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.last_safe_offset.saturating_add(1)
    }

    /// Moves the cursor forward. Returns false and leaves the cursor
    /// unchanged if `offset` is not past the current position.
    pub fn advance(&mut self, offset: u64) -> bool {
        if offset > self.last_safe_offset {
            self.last_safe_offset = offset;
            true
        } else {
            false
        }
    }
}
