//! File-backed record storage.

use crate::atomic::write_atomic;
use crate::error::{StorageError, StorageResult};
use crate::frame::{
    decode_frame, encode_frame, FrameRead, FRAME_HEADER_SIZE, FRAME_OVERHEAD, MAX_FRAME_PAYLOAD,
};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A decoded frame and where it starts in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Byte position of the frame start.
    pub position: u64,
    /// The frame payload.
    pub payload: Vec<u8>,
}

/// The frames found between a start position and the end of the file.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    /// Complete frames in file order.
    pub frames: Vec<Frame>,
    /// Position just past the last complete frame.
    pub end: u64,
    /// True if bytes of an unfinished frame follow `end`.
    pub incomplete_tail: bool,
}

/// An append-only file of checksummed frames with a single writer.
///
/// Opening the file recovers from a crash mid-append: an unfinished frame
/// at the tail is cut off. A damaged frame anywhere else is reported as
/// [`StorageError::Corrupted`] and the file is left untouched.
///
/// # Durability
///
/// [`append`](Self::append) hands the bytes to the OS;
/// [`sync`](Self::sync) makes them durable.
///
/// # Thread Safety
///
/// The file is guarded by an internal lock and can be shared across threads.
#[derive(Debug)]
pub struct RecordFile {
    path: PathBuf,
    inner: Mutex<WriterState>,
    recovered_bytes: u64,
}

#[derive(Debug)]
struct WriterState {
    file: File,
    len: u64,
    // set when a failed append could not be rolled back
    poisoned: bool,
}

impl RecordFile {
    /// Opens or creates a record file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or holds a corrupted frame.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let scan = scan_file(&mut file, 0)?;
        let mut recovered_bytes = 0;
        if scan.incomplete_tail {
            file.set_len(scan.end)?;
            file.sync_all()?;
            recovered_bytes = file_len - scan.end;
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WriterState {
                file,
                len: scan.end,
                poisoned: false,
            }),
            recovered_bytes,
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes of an unfinished frame cut off when the file was opened.
    #[must_use]
    pub fn recovered_bytes(&self) -> u64 {
        self.recovered_bytes
    }

    /// Current length of the file in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.lock().len
    }

    /// Returns true if the file holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends one frame and returns its start position.
    ///
    /// A failed write is rolled back so the file never ends in a partial
    /// frame written by this process. If the rollback fails too, the file
    /// refuses appends with [`StorageError::Poisoned`] until it is reopened
    /// or rewritten.
    pub fn append(&self, payload: &[u8]) -> StorageResult<u64> {
        let frame = encode_frame(payload)?;
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(StorageError::Poisoned {
                path: self.path.clone(),
            });
        }
        let position = inner.len;

        let written = inner
            .file
            .seek(SeekFrom::Start(position))
            .and_then(|_| inner.file.write_all(&frame));
        if let Err(err) = written {
            if let Err(rollback) = inner.file.set_len(position) {
                warn!(
                    path = %self.path.display(),
                    position,
                    error = %rollback,
                    "could not roll back failed append, refusing further appends"
                );
                inner.poisoned = true;
            }
            return Err(StorageError::Io(err));
        }

        inner.len = position + frame.len() as u64;
        Ok(position)
    }

    /// Forces appended frames to disk.
    pub fn sync(&self) -> StorageResult<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    /// Reads every complete frame starting at byte `from`.
    pub fn scan_from(&self, from: u64) -> StorageResult<Scan> {
        let mut inner = self.inner.lock();
        scan_file(&mut inner.file, from)
    }

    /// Atomically replaces the whole file with the given payloads.
    pub fn rewrite<'a, I>(&self, payloads: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut data = Vec::new();
        for payload in payloads {
            data.extend_from_slice(&encode_frame(payload)?);
        }

        let mut inner = self.inner.lock();
        write_atomic(&self.path, &data)?;
        inner.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        inner.len = data.len() as u64;
        inner.poisoned = false;
        Ok(())
    }
}

/// Read-only view of a record file that another writer may still extend.
///
/// The file does not need to exist yet; until it does every scan is empty.
/// An unfinished frame at the tail is treated as not yet written.
#[derive(Debug)]
pub struct RecordReader {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl RecordReader {
    /// Creates a reader for `path`.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
        }
    }

    /// Returns the path being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every complete frame starting at byte `from`.
    pub fn scan_from(&self, from: u64) -> StorageResult<Scan> {
        let mut slot = self.file.lock();
        match open_if_exists(&mut slot, &self.path)? {
            Some(file) => scan_file(file, from),
            None => Ok(Scan {
                end: from,
                ..Scan::default()
            }),
        }
    }

    /// Reads the single frame starting at byte `position`.
    ///
    /// Returns `None` while the file is missing or the frame is unfinished.
    pub fn read_at(&self, position: u64) -> StorageResult<Option<Frame>> {
        let mut slot = self.file.lock();
        match open_if_exists(&mut slot, &self.path)? {
            Some(file) => read_frame(file, position),
            None => Ok(None),
        }
    }
}

fn open_if_exists<'a>(slot: &'a mut Option<File>, path: &Path) -> StorageResult<Option<&'a mut File>> {
    if slot.is_none() {
        match File::open(path) {
            Ok(file) => *slot = Some(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(slot.as_mut())
}

fn read_frame(file: &mut File, position: u64) -> StorageResult<Option<Frame>> {
    let len = file.metadata()?.len();
    if position.saturating_add(FRAME_HEADER_SIZE as u64) > len {
        return Ok(None);
    }

    let mut header = [0u8; FRAME_HEADER_SIZE];
    file.seek(SeekFrom::Start(position))?;
    file.read_exact(&mut header)?;
    let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
    let encoded_len = (FRAME_OVERHEAD as u64).saturating_add(payload_len);
    if payload_len > MAX_FRAME_PAYLOAD as u64 || position.saturating_add(encoded_len) > len {
        // decode_frame reports a bad header; otherwise the frame is still being written
        return match decode_frame(&header, position)? {
            FrameRead::Complete { .. } | FrameRead::Incomplete => Ok(None),
        };
    }

    let mut buf = vec![0u8; encoded_len as usize];
    buf[..FRAME_HEADER_SIZE].copy_from_slice(&header);
    file.read_exact(&mut buf[FRAME_HEADER_SIZE..])?;
    match decode_frame(&buf, position)? {
        FrameRead::Complete { payload, .. } => Ok(Some(Frame {
            position,
            payload: payload.to_vec(),
        })),
        FrameRead::Incomplete => Ok(None),
    }
}

fn scan_file(file: &mut File, from: u64) -> StorageResult<Scan> {
    let len = file.metadata()?.len();
    if from >= len {
        return Ok(Scan {
            end: from,
            ..Scan::default()
        });
    }

    file.seek(SeekFrom::Start(from))?;
    let mut buf = Vec::with_capacity((len - from) as usize);
    Read::by_ref(file)
        .take(len - from)
        .read_to_end(&mut buf)?;

    let mut frames = Vec::new();
    let mut cursor = 0usize;
    let mut incomplete_tail = false;
    while cursor < buf.len() {
        let position = from + cursor as u64;
        match decode_frame(&buf[cursor..], position)? {
            FrameRead::Complete {
                payload,
                encoded_len,
            } => {
                frames.push(Frame {
                    position,
                    payload: payload.to_vec(),
                });
                cursor += encoded_len;
            }
            FrameRead::Incomplete => {
                incomplete_tail = true;
                break;
            }
        }
    }

    Ok(Scan {
        frames,
        end: from + cursor as u64,
        incomplete_tail,
    })
}
