//! Log source abstraction.

use crate::error::{SourceError, SourceResult};
use bytes::Bytes;
use logsink_model::{LogRecord, PartitionId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pull-based access to a partitioned, append-only log.
///
/// Offsets within a partition increase strictly but may have gaps
/// (compaction, retention), which is why fetches are "at or after".
pub trait LogSource: Send + Sync {
    /// Returns the first record of `partition` whose offset is at least
    /// `offset`, waiting up to `timeout` for one to appear.
    ///
    /// `Ok(None)` means no data arrived in time; it is not an error.
    fn fetch(
        &self,
        partition: PartitionId,
        offset: u64,
        timeout: Duration,
    ) -> SourceResult<Option<LogRecord>>;

    /// Offset of the oldest record still available in `partition`.
    fn earliest_offset(&self, partition: PartitionId) -> SourceResult<u64>;

    /// Offset the next record appended to `partition` will receive.
    fn end_offset(&self, partition: PartitionId) -> SourceResult<u64>;
}

impl<T: LogSource + ?Sized> LogSource for Arc<T> {
    fn fetch(
        &self,
        partition: PartitionId,
        offset: u64,
        timeout: Duration,
    ) -> SourceResult<Option<LogRecord>> {
        (**self).fetch(partition, offset, timeout)
    }

    fn earliest_offset(&self, partition: PartitionId) -> SourceResult<u64> {
        (**self).earliest_offset(partition)
    }

    fn end_offset(&self, partition: PartitionId) -> SourceResult<u64> {
        (**self).end_offset(partition)
    }
}

/// An in-process log.
///
/// Fetches block on a condition variable until a record is appended or the
/// timeout passes. Failures can be queued to exercise reconnect handling.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<MemoryLogState>,
    appended: Condvar,
}

#[derive(Debug, Default)]
struct MemoryLogState {
    partitions: HashMap<PartitionId, PartitionLog>,
    faults: VecDeque<SourceError>,
    fetches: u64,
}

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<LogRecord>,
    next_offset: u64,
    earliest: u64,
}

impl PartitionLog {
    fn first_at_or_after(&self, offset: u64) -> Option<&LogRecord> {
        let index = self.records.partition_point(|r| r.offset < offset);
        self.records.get(index)
    }
}

impl MemoryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record to `partition` and returns its offset.
    pub fn append(&self, partition: PartitionId, value: impl Into<Bytes>) -> u64 {
        self.append_at(partition, 0, value)
    }

    /// Appends a record at `offset` or at the next free offset, whichever
    /// is higher, and returns the offset used. Skipping ahead leaves a gap.
    pub fn append_at(&self, partition: PartitionId, offset: u64, value: impl Into<Bytes>) -> u64 {
        let mut state = self.state.lock();
        let log = state.partitions.entry(partition).or_default();
        let offset = offset.max(log.next_offset);
        log.records.push(LogRecord::new(partition, offset, value));
        log.next_offset = offset + 1;
        self.appended.notify_all();
        offset
    }

    /// Drops every record below `offset`, as retention would.
    pub fn truncate_before(&self, partition: PartitionId, offset: u64) {
        let mut state = self.state.lock();
        let log = state.partitions.entry(partition).or_default();
        log.records.retain(|r| r.offset >= offset);
        log.earliest = log.earliest.max(offset);
        log.next_offset = log.next_offset.max(offset);
    }

    /// Makes the next fetches fail with `errors`, in order.
    pub fn fail_next_fetches(&self, errors: impl IntoIterator<Item = SourceError>) {
        self.state.lock().faults.extend(errors);
    }

    /// Number of fetch calls served so far.
    pub fn fetch_count(&self) -> u64 {
        self.state.lock().fetches
    }

    /// Number of records held for `partition`.
    pub fn len(&self, partition: PartitionId) -> usize {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .map_or(0, |log| log.records.len())
    }
}

impl LogSource for MemoryLog {
    fn fetch(
        &self,
        partition: PartitionId,
        offset: u64,
        timeout: Duration,
    ) -> SourceResult<Option<LogRecord>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        state.fetches += 1;
        if let Some(err) = state.faults.pop_front() {
            return Err(err);
        }

        loop {
            let found = state
                .partitions
                .get(&partition)
                .and_then(|log| log.first_at_or_after(offset))
                .cloned();
            if found.is_some() {
                return Ok(found);
            }

            match deadline {
                Some(deadline) => {
                    if self.appended.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state
                            .partitions
                            .get(&partition)
                            .and_then(|log| log.first_at_or_after(offset))
                            .cloned());
                    }
                }
                None => self.appended.wait(&mut state),
            }
        }
    }

    fn earliest_offset(&self, partition: PartitionId) -> SourceResult<u64> {
        let state = self.state.lock();
        Ok(state.partitions.get(&partition).map_or(0, |log| {
            log.records.first().map_or(log.earliest, |r| r.offset)
        }))
    }

    fn end_offset(&self, partition: PartitionId) -> SourceResult<u64> {
        let state = self.state.lock();
        Ok(state
            .partitions
            .get(&partition)
            .map_or(0, |log| log.next_offset))
    }
}
