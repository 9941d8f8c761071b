//! Partitioned log on local files.
//!
//! Each partition of a topic is one append-only record file:
//!
//! ```text
//! <dir>/
//! ├─ events-00000.log
//! ├─ events-00000.log.lock   # held by the single producer of partition 0
//! └─ events-00001.log
//! ```
//!
//! Frames hold CBOR-encoded [`LogRecord`]s with strictly increasing
//! offsets. Producers append through a [`FileLogAppender`]; consumers read
//! through [`FileLog`], which tails the files and never writes them.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{SourceError, SourceResult};
use crate::source::LogSource;
use bytes::Bytes;
use fs2::FileExt;
use logsink_model::{LogRecord, PartitionId};
use logsink_storage::{RecordFile, RecordReader, StorageError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const LOG_EXTENSION: &str = "log";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Read side of a file-backed topic.
#[derive(Debug)]
pub struct FileLog {
    dir: PathBuf,
    topic: String,
    poll_interval: Duration,
    tails: Mutex<HashMap<PartitionId, Arc<PartitionTail>>>,
}

/// Offsets of one partition file mapped to their byte positions.
#[derive(Debug)]
struct PartitionTail {
    reader: RecordReader,
    index: Mutex<TailIndex>,
}

#[derive(Debug, Default)]
struct TailIndex {
    entries: Vec<(u64, u64)>,
    scanned_to: u64,
}

impl PartitionTail {
    fn new(path: &Path) -> Self {
        Self {
            reader: RecordReader::new(path),
            index: Mutex::new(TailIndex::default()),
        }
    }

    /// Indexes frames appended since the last call.
    fn refresh(&self, index: &mut TailIndex) -> SourceResult<()> {
        let scan = self.reader.scan_from(index.scanned_to)?;
        for frame in scan.frames {
            let record: LogRecord = from_cbor(&frame.payload).map_err(SourceError::Encoding)?;
            index.entries.push((record.offset, frame.position));
        }
        index.scanned_to = scan.end;
        Ok(())
    }

    fn first_at_or_after(&self, offset: u64) -> SourceResult<Option<LogRecord>> {
        let mut index = self.index.lock();
        self.refresh(&mut index)?;

        let slot = index.entries.partition_point(|(o, _)| *o < offset);
        let Some(&(_, position)) = index.entries.get(slot) else {
            return Ok(None);
        };
        match self.reader.read_at(position)? {
            Some(frame) => Ok(Some(
                from_cbor(&frame.payload).map_err(SourceError::Encoding)?,
            )),
            None => Ok(None),
        }
    }

    fn bounds(&self) -> SourceResult<Option<(u64, u64)>> {
        let mut index = self.index.lock();
        self.refresh(&mut index)?;
        Ok(match (index.entries.first(), index.entries.last()) {
            (Some(first), Some(last)) => Some((first.0, last.0)),
            _ => None,
        })
    }
}

impl FileLog {
    /// Opens the log directory of `topic`, creating the directory if needed.
    pub fn open(dir: &Path, topic: &str) -> SourceResult<Self> {
        validate_topic(topic)?;
        fs::create_dir_all(dir).map_err(StorageError::from)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            topic: topic.to_owned(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            tails: Mutex::new(HashMap::new()),
        })
    }

    /// Sets how often an empty partition is re-read while a fetch waits.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Path of the file holding `partition`.
    pub fn partition_path(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(format!(
            "{}-{:05}.{LOG_EXTENSION}",
            self.topic,
            partition.get()
        ))
    }

    /// Partitions that have a file on disk, sorted.
    pub fn partitions(&self) -> SourceResult<Vec<PartitionId>> {
        let prefix = format!("{}-", self.topic);
        let mut partitions = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(StorageError::from)? {
            let path = entry.map_err(StorageError::from)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(number) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(prefix.as_str()))
                .and_then(|s| s.parse::<u32>().ok())
            {
                partitions.push(PartitionId(number));
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    /// Opens the write side of `partition`.
    ///
    /// # Errors
    ///
    /// Fails with [`SourceError::Unavailable`] while another appender holds
    /// the partition.
    pub fn appender(&self, partition: PartitionId) -> SourceResult<FileLogAppender> {
        FileLogAppender::open(&self.partition_path(partition), partition)
    }

    fn tail(&self, partition: PartitionId) -> Arc<PartitionTail> {
        let mut tails = self.tails.lock();
        let tail = tails
            .entry(partition)
            .or_insert_with(|| Arc::new(PartitionTail::new(&self.partition_path(partition))));
        Arc::clone(tail)
    }
}

fn validate_topic(topic: &str) -> SourceResult<()> {
    let valid = !topic.is_empty()
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(SourceError::InvalidTopic(topic.to_owned()))
    }
}

impl LogSource for FileLog {
    fn fetch(
        &self,
        partition: PartitionId,
        offset: u64,
        timeout: Duration,
    ) -> SourceResult<Option<LogRecord>> {
        let tail = self.tail(partition);
        let started = Instant::now();
        loop {
            if let Some(record) = tail.first_at_or_after(offset)? {
                return Ok(Some(record));
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    fn earliest_offset(&self, partition: PartitionId) -> SourceResult<u64> {
        Ok(self.tail(partition).bounds()?.map_or(0, |(first, _)| first))
    }

    fn end_offset(&self, partition: PartitionId) -> SourceResult<u64> {
        Ok(self
            .tail(partition)
            .bounds()?
            .map_or(0, |(_, last)| last.saturating_add(1)))
    }
}

/// Write side of one partition.
///
/// Holds an exclusive lock on the partition for as long as it lives, so
/// offsets are assigned by exactly one writer.
#[derive(Debug)]
pub struct FileLogAppender {
    partition: PartitionId,
    file: RecordFile,
    next_offset: u64,
    _lock_file: File,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl FileLogAppender {
    fn open(path: &Path, partition: PartitionId) -> SourceResult<Self> {
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(PathBuf::from(lock_path))
            .map_err(StorageError::from)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SourceError::Unavailable(format!(
                "partition {partition} is held by another producer"
            )));
        }

        let file = RecordFile::open(path)?;
        if file.recovered_bytes() > 0 {
            tracing::warn!(
                partition = partition.get(),
                bytes = file.recovered_bytes(),
                "discarded unfinished record at log tail"
            );
        }

        let mut next_offset = 0;
        if let Some(last) = file.scan_from(0)?.frames.last() {
            let record: LogRecord = from_cbor(&last.payload).map_err(SourceError::Encoding)?;
            next_offset = record.offset.saturating_add(1);
        }

        Ok(Self {
            partition,
            file,
            next_offset,
            _lock_file: lock_file,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Partition written.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Offset the next append will receive.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Appends a record and syncs it before returning.
    ///
    /// The offset is spent once the frame is written, even if the sync
    /// then fails, so a retried append never reuses it.
    pub fn append(&mut self, key: Option<Bytes>, value: impl Into<Bytes>) -> SourceResult<LogRecord> {
        let mut record = LogRecord::new(self.partition, self.next_offset, value);
        record.key = key;

        let payload = to_cbor(&record).map_err(SourceError::Encoding)?;
        self.file.append(&payload)?;
        self.next_offset += 1;
        self.sync()?;
        Ok(record)
    }

    fn sync(&mut self) -> SourceResult<()> {
        #[cfg(test)]
        let injected = std::mem::take(&mut self.fail_next_sync);
        #[cfg(not(test))]
        let injected = false;
        if injected {
            return Err(SourceError::Unavailable("sync failed".into()));
        }
        self.file.sync()?;
        Ok(())
    }
}
