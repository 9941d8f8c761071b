//! Per-partition offset tracking.

use crate::codec::{from_cbor, to_cbor};
use crate::error::OffsetCommitError;
use logsink_model::{CommitCursor, PartitionId};
use logsink_storage::{sync_directory, write_atomic};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CURSOR_EXTENSION: &str = "cursor";

/// Result of a commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The cursor moved forward.
    Advanced,
    /// The cursor already held this offset.
    Unchanged,
    /// The offset is below the cursor; nothing was written.
    Stale,
}

/// Durable record of how far each partition has been handled.
///
/// Commits are monotonic: a lower offset never moves a cursor back.
pub trait OffsetTracker: Send + Sync {
    /// Reads the cursor of `partition`, if one was ever committed.
    fn load(&self, partition: PartitionId) -> Result<Option<CommitCursor>, OffsetCommitError>;

    /// Records that every offset of `partition` up to `offset` is handled.
    fn commit(&self, partition: PartitionId, offset: u64)
        -> Result<CommitOutcome, OffsetCommitError>;
}

impl<T: OffsetTracker + ?Sized> OffsetTracker for Arc<T> {
    fn load(&self, partition: PartitionId) -> Result<Option<CommitCursor>, OffsetCommitError> {
        (**self).load(partition)
    }

    fn commit(
        &self,
        partition: PartitionId,
        offset: u64,
    ) -> Result<CommitOutcome, OffsetCommitError> {
        (**self).commit(partition, offset)
    }
}

fn advance(
    cursors: &HashMap<PartitionId, CommitCursor>,
    partition: PartitionId,
    offset: u64,
) -> (CommitOutcome, CommitCursor) {
    let Some(mut cursor) = cursors.get(&partition).copied() else {
        return (CommitOutcome::Advanced, CommitCursor::new(partition, offset));
    };
    if cursor.advance(offset) {
        (CommitOutcome::Advanced, cursor)
    } else if offset == cursor.last_safe_offset {
        (CommitOutcome::Unchanged, cursor)
    } else {
        (CommitOutcome::Stale, cursor)
    }
}

/// An in-memory offset tracker that remembers every commit it accepted.
#[derive(Debug, Default)]
pub struct MemoryOffsetTracker {
    cursors: RwLock<HashMap<PartitionId, CommitCursor>>,
    history: Mutex<Vec<CommitCursor>>,
    faults: Mutex<VecDeque<OffsetCommitError>>,
}

impl MemoryOffsetTracker {
    /// Creates a tracker with no cursors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `partition` with a cursor at `offset`.
    pub fn with_cursor(self, partition: PartitionId, offset: u64) -> Self {
        self.cursors
            .write()
            .insert(partition, CommitCursor::new(partition, offset));
        self
    }

    /// Makes the next commits fail with `errors`, in order.
    pub fn fail_next_commits(&self, errors: impl IntoIterator<Item = OffsetCommitError>) {
        self.faults.lock().extend(errors);
    }

    /// Every cursor value that advanced, in commit order.
    pub fn history(&self) -> Vec<CommitCursor> {
        self.history.lock().clone()
    }

    /// Sets or clears a cursor regardless of its current value.
    pub fn reset(&self, partition: PartitionId, offset: Option<u64>) {
        let mut cursors = self.cursors.write();
        match offset {
            Some(offset) => {
                cursors.insert(partition, CommitCursor::new(partition, offset));
            }
            None => {
                cursors.remove(&partition);
            }
        }
    }
}

impl OffsetTracker for MemoryOffsetTracker {
    fn load(&self, partition: PartitionId) -> Result<Option<CommitCursor>, OffsetCommitError> {
        Ok(self.cursors.read().get(&partition).copied())
    }

    fn commit(
        &self,
        partition: PartitionId,
        offset: u64,
    ) -> Result<CommitOutcome, OffsetCommitError> {
        if let Some(err) = self.faults.lock().pop_front() {
            return Err(err);
        }

        let mut cursors = self.cursors.write();
        let (outcome, cursor) = advance(&cursors, partition, offset);
        if outcome == CommitOutcome::Advanced {
            cursors.insert(partition, cursor);
            self.history.lock().push(cursor);
        }
        Ok(outcome)
    }
}

/// Offset tracker keeping one cursor file per partition.
///
/// ```text
/// <dir>/
/// ├─ partition-00000.cursor
/// └─ partition-00001.cursor
/// ```
///
/// Each commit replaces the partition's file atomically, so a crash leaves
/// either the previous cursor or the new one. Cursors are cached after the
/// first read.
#[derive(Debug)]
pub struct FileOffsetTracker {
    dir: PathBuf,
    cache: RwLock<HashMap<PartitionId, CommitCursor>>,
}

impl FileOffsetTracker {
    /// Opens the cursor directory, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self, OffsetCommitError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Directory holding the cursor files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn cursor_path(&self, partition: PartitionId) -> PathBuf {
        self.dir
            .join(format!("partition-{:05}.{CURSOR_EXTENSION}", partition.get()))
    }

    fn read_cursor(&self, partition: PartitionId) -> Result<Option<CommitCursor>, OffsetCommitError> {
        let bytes = match fs::read(self.cursor_path(partition)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let cursor: CommitCursor = from_cbor(&bytes).map_err(|message| OffsetCommitError::Corrupt {
            partition,
            message,
        })?;
        if cursor.partition != partition {
            return Err(OffsetCommitError::Corrupt {
                partition,
                message: format!("file holds the cursor of partition {}", cursor.partition),
            });
        }
        Ok(Some(cursor))
    }

    fn write_cursor(&self, cursor: CommitCursor) -> Result<(), OffsetCommitError> {
        let bytes = to_cbor(&cursor).map_err(|message| OffsetCommitError::Corrupt {
            partition: cursor.partition,
            message,
        })?;
        write_atomic(&self.cursor_path(cursor.partition), &bytes)?;
        Ok(())
    }

    fn cached(
        &self,
        cache: &mut HashMap<PartitionId, CommitCursor>,
        partition: PartitionId,
    ) -> Result<(), OffsetCommitError> {
        if !cache.contains_key(&partition) {
            if let Some(cursor) = self.read_cursor(partition)? {
                cache.insert(partition, cursor);
            }
        }
        Ok(())
    }

    /// Sets or clears a cursor regardless of its current value.
    ///
    /// This is the operator's way to replay or skip part of a partition;
    /// the pipeline itself never calls it.
    pub fn reset(&self, partition: PartitionId, offset: Option<u64>) -> Result<(), OffsetCommitError> {
        let mut cache = self.cache.write();
        match offset {
            Some(offset) => {
                let cursor = CommitCursor::new(partition, offset);
                self.write_cursor(cursor)?;
                cache.insert(partition, cursor);
            }
            None => {
                match fs::remove_file(self.cursor_path(partition)) {
                    Ok(()) => sync_directory(&self.dir)?,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                cache.remove(&partition);
            }
        }
        Ok(())
    }

    /// Every cursor stored in the directory, ordered by partition.
    pub fn cursors(&self) -> Result<Vec<CommitCursor>, OffsetCommitError> {
        let mut partitions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CURSOR_EXTENSION) {
                continue;
            }
            let number = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("partition-"))
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(number) = number {
                partitions.push(PartitionId(number));
            }
        }
        partitions.sort();

        let mut cursors = Vec::with_capacity(partitions.len());
        for partition in partitions {
            if let Some(cursor) = self.load(partition)? {
                cursors.push(cursor);
            }
        }
        Ok(cursors)
    }
}

impl OffsetTracker for FileOffsetTracker {
    fn load(&self, partition: PartitionId) -> Result<Option<CommitCursor>, OffsetCommitError> {
        if let Some(cursor) = self.cache.read().get(&partition) {
            return Ok(Some(*cursor));
        }
        let mut cache = self.cache.write();
        self.cached(&mut cache, partition)?;
        Ok(cache.get(&partition).copied())
    }

    fn commit(
        &self,
        partition: PartitionId,
        offset: u64,
    ) -> Result<CommitOutcome, OffsetCommitError> {
        let mut cache = self.cache.write();
        self.cached(&mut cache, partition)?;

        let (outcome, cursor) = advance(&cache, partition, offset);
        if outcome == CommitOutcome::Advanced {
            self.write_cursor(cursor)?;
            cache.insert(partition, cursor);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const P0: PartitionId = PartitionId(0);

    #[test]
    fn memory_commits_are_monotonic() {
        let tracker = MemoryOffsetTracker::new();
        assert!(tracker.load(P0).unwrap().is_none());

        assert_eq!(tracker.commit(P0, 0).unwrap(), CommitOutcome::Advanced);
        assert_eq!(tracker.commit(P0, 3).unwrap(), CommitOutcome::Advanced);
        assert_eq!(tracker.commit(P0, 3).unwrap(), CommitOutcome::Unchanged);
        assert_eq!(tracker.commit(P0, 1).unwrap(), CommitOutcome::Stale);

        assert_eq!(tracker.load(P0).unwrap().unwrap().last_safe_offset, 3);
        let offsets: Vec<u64> = tracker.history().iter().map(|c| c.last_safe_offset).collect();
        assert_eq!(offsets, vec![0, 3]);
    }

    #[test]
    fn memory_injected_failure() {
        let tracker = MemoryOffsetTracker::new();
        tracker.fail_next_commits([OffsetCommitError::Unavailable("disk full".into())]);
        assert!(tracker.commit(P0, 0).is_err());
        assert!(tracker.load(P0).unwrap().is_none());
        assert_eq!(tracker.commit(P0, 0).unwrap(), CommitOutcome::Advanced);
    }

    #[test]
    fn memory_reset_bypasses_monotonicity() {
        let tracker = MemoryOffsetTracker::new().with_cursor(P0, 10);
        tracker.reset(P0, Some(2));
        assert_eq!(tracker.load(P0).unwrap().unwrap().last_safe_offset, 2);
        tracker.reset(P0, None);
        assert!(tracker.load(P0).unwrap().is_none());
    }

    #[test]
    fn file_cursor_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let tracker = FileOffsetTracker::open(dir.path()).unwrap();
            tracker.commit(P0, 7).unwrap();
            tracker.commit(PartitionId(3), 1).unwrap();
        }

        let tracker = FileOffsetTracker::open(dir.path()).unwrap();
        let cursor = tracker.load(P0).unwrap().unwrap();
        assert_eq!(cursor.last_safe_offset, 7);
        assert_eq!(cursor.resume_offset(), 8);
        assert_eq!(tracker.commit(P0, 5).unwrap(), CommitOutcome::Stale);

        let all = tracker.cursors().unwrap();
        assert_eq!(
            all,
            vec![CommitCursor::new(P0, 7), CommitCursor::new(PartitionId(3), 1)]
        );
    }

    #[test]
    fn file_stale_commit_does_not_rewrite() {
        let dir = tempdir().unwrap();
        let tracker = FileOffsetTracker::open(dir.path()).unwrap();
        tracker.commit(P0, 4).unwrap();
        tracker.commit(P0, 2).unwrap();

        let reopened = FileOffsetTracker::open(dir.path()).unwrap();
        assert_eq!(reopened.load(P0).unwrap().unwrap().last_safe_offset, 4);
    }

    #[test]
    fn file_reset_sets_and_clears() {
        let dir = tempdir().unwrap();
        let tracker = FileOffsetTracker::open(dir.path()).unwrap();
        tracker.commit(P0, 9).unwrap();

        tracker.reset(P0, Some(3)).unwrap();
        assert_eq!(
            FileOffsetTracker::open(dir.path())
                .unwrap()
                .load(P0)
                .unwrap()
                .unwrap()
                .last_safe_offset,
            3
        );

        tracker.reset(P0, None).unwrap();
        assert!(tracker.load(P0).unwrap().is_none());
        assert!(FileOffsetTracker::open(dir.path())
            .unwrap()
            .load(P0)
            .unwrap()
            .is_none());
        tracker.reset(P0, None).unwrap();
    }

    #[test]
    fn damaged_cursor_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("partition-00000.cursor"), b"\xff\x00garbage").unwrap();

        let tracker = FileOffsetTracker::open(dir.path()).unwrap();
        assert!(matches!(
            tracker.load(P0),
            Err(OffsetCommitError::Corrupt { .. })
        ));
    }
}
