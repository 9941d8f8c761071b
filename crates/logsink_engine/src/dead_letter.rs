//! Dead-letter sinks.

use crate::codec::{from_cbor, to_cbor};
use crate::error::DeadLetterError;
use logsink_model::{DeadLetterRecord, PartitionId};
use logsink_storage::{compute_crc32, RecordFile, MAX_FRAME_PAYLOAD};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const JOURNAL_EXTENSION: &str = "dlq";

/// Bytes of an oversized record value kept in its journal entry.
pub const VALUE_PREVIEW_LEN: usize = 64 * 1024;

/// Append-only destination for records that cannot be ingested.
///
/// A dead-letter sink must not depend on the primary document store: it
/// is what keeps the stream moving while the store rejects records.
pub trait DeadLetterSink: Send + Sync {
    /// Durably stores one dead letter.
    fn append(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError>;
}

impl<T: DeadLetterSink + ?Sized> DeadLetterSink for Arc<T> {
    fn append(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        (**self).append(record)
    }
}

/// An in-memory dead-letter sink with failure injection.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
    faults: Mutex<VecDeque<DeadLetterError>>,
}

impl MemoryDeadLetterSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next appends fail with `errors`, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = DeadLetterError>) {
        self.faults.lock().extend(errors);
    }

    /// Dead letters stored so far, in arrival order.
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }

    /// Number of dead letters stored.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing was dead-lettered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn append(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        if let Some(err) = self.faults.lock().pop_front() {
            return Err(err);
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Dead-letter journal with one append-only file per partition.
///
/// ```text
/// <dir>/
/// ├─ partition-00000.dlq
/// └─ partition-00001.dlq
/// ```
///
/// Every append is synced before it returns. Partitions write to separate
/// files, so workers never wait on each other here.
///
/// A dead letter too large for one journal frame is stored with the first
/// [`VALUE_PREVIEW_LEN`] bytes of its value, plus the original length and
/// checksum.
#[derive(Debug)]
pub struct FileDeadLetterSink {
    dir: PathBuf,
    journals: Mutex<HashMap<PartitionId, Arc<RecordFile>>>,
}

impl FileDeadLetterSink {
    /// Opens the journal directory, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self, DeadLetterError> {
        fs::create_dir_all(dir).map_err(logsink_storage::StorageError::from)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            journals: Mutex::new(HashMap::new()),
        })
    }

    fn journal_path(&self, partition: PartitionId) -> PathBuf {
        self.dir
            .join(format!("partition-{:05}.{JOURNAL_EXTENSION}", partition.get()))
    }

    fn journal(&self, partition: PartitionId) -> Result<Arc<RecordFile>, DeadLetterError> {
        let mut journals = self.journals.lock();
        if let Some(journal) = journals.get(&partition) {
            return Ok(Arc::clone(journal));
        }
        let journal = Arc::new(RecordFile::open(&self.journal_path(partition))?);
        if journal.recovered_bytes() > 0 {
            tracing::warn!(
                partition = partition.get(),
                bytes = journal.recovered_bytes(),
                "discarded unfinished dead letter at journal tail"
            );
        }
        journals.insert(partition, Arc::clone(&journal));
        Ok(journal)
    }

    /// Reads the dead letters of one partition, or of all partitions when
    /// `partition` is `None`, ordered by partition then arrival.
    pub fn read(&self, partition: Option<PartitionId>) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let partitions = match partition {
            Some(partition) => vec![partition],
            None => self.partitions()?,
        };

        let mut records = Vec::new();
        for partition in partitions {
            if !self.journal_path(partition).exists() {
                continue;
            }
            let scan = self.journal(partition)?.scan_from(0)?;
            for frame in scan.frames {
                records.push(from_cbor(&frame.payload).map_err(DeadLetterError::Encoding)?);
            }
        }
        Ok(records)
    }

    /// Number of dead letters across every partition.
    pub fn count(&self) -> Result<usize, DeadLetterError> {
        let mut total = 0;
        for partition in self.partitions()? {
            total += self.journal(partition)?.scan_from(0)?.frames.len();
        }
        Ok(total)
    }

    fn partitions(&self) -> Result<Vec<PartitionId>, DeadLetterError> {
        let mut partitions = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(logsink_storage::StorageError::from)?;
        for entry in entries {
            let path = entry.map_err(logsink_storage::StorageError::from)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
                continue;
            }
            if let Some(number) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("partition-"))
                .and_then(|s| s.parse::<u32>().ok())
            {
                partitions.push(PartitionId(number));
            }
        }
        partitions.sort();
        Ok(partitions)
    }
}

impl DeadLetterSink for FileDeadLetterSink {
    fn append(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let mut payload = to_cbor(record).map_err(DeadLetterError::Encoding)?;
        if payload.len() > MAX_FRAME_PAYLOAD {
            tracing::warn!(
                partition = record.record.partition.get(),
                offset = record.record.offset,
                bytes = record.record.value.len(),
                "dead letter exceeds the journal frame limit, keeping a preview"
            );
            let preview = record
                .clone()
                .into_preview(VALUE_PREVIEW_LEN, compute_crc32(&record.record.value));
            payload = to_cbor(&preview).map_err(DeadLetterError::Encoding)?;
        }
        let journal = self.journal(record.record.partition)?;
        journal.append(&payload)?;
        journal.sync()?;
        Ok(())
    }
}
