//! Frame encoding and validation.

use crate::checksum::update_crc32;
use crate::error::{StorageError, StorageResult};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"LSRF";

/// Bytes a frame adds around its payload (magic, length, checksum).
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Bytes before the payload (magic and length).
pub const FRAME_HEADER_SIZE: usize = 8;

const HEADER_SIZE: usize = FRAME_HEADER_SIZE;
const CHECKSUM_SIZE: usize = 4;

/// Result of decoding the bytes at the head of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameRead<'a> {
    /// A whole, valid frame.
    Complete {
        /// The frame payload.
        payload: &'a [u8],
        /// Total encoded size of the frame, overhead included.
        encoded_len: usize,
    },
    /// The buffer ends before the frame does.
    Incomplete,
}

/// Encodes `payload` as a single frame.
///
/// # Errors
///
/// Returns [`StorageError::FrameTooLarge`] if the payload exceeds
/// [`MAX_FRAME_PAYLOAD`].
pub fn encode_frame(payload: &[u8]) -> StorageResult<Vec<u8>> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(StorageError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let len_bytes = (payload.len() as u32).to_le_bytes();
    let crc = frame_checksum(&len_bytes, payload);

    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&len_bytes);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decodes the frame at the start of `buf`.
///
/// `position` is the absolute byte position of `buf[0]` and is only used
/// to report corruption.
///
/// # Errors
///
/// Returns [`StorageError::Corrupted`] when a frame is complete but its
/// magic, length or checksum is wrong.
pub fn decode_frame(buf: &[u8], position: u64) -> StorageResult<FrameRead<'_>> {
    if buf.len() < HEADER_SIZE {
        if !FRAME_MAGIC.starts_with(&buf[..buf.len().min(FRAME_MAGIC.len())]) {
            return Err(StorageError::corrupted(position, "bad magic"));
        }
        return Ok(FrameRead::Incomplete);
    }

    if buf[..4] != FRAME_MAGIC {
        return Err(StorageError::corrupted(position, "bad magic"));
    }

    let len_bytes = [buf[4], buf[5], buf[6], buf[7]];
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(StorageError::corrupted(
            position,
            format!("declared length {len} exceeds limit"),
        ));
    }

    let encoded_len = HEADER_SIZE + len + CHECKSUM_SIZE;
    if buf.len() < encoded_len {
        return Ok(FrameRead::Incomplete);
    }

    let payload = &buf[HEADER_SIZE..HEADER_SIZE + len];
    let stored = u32::from_le_bytes([
        buf[HEADER_SIZE + len],
        buf[HEADER_SIZE + len + 1],
        buf[HEADER_SIZE + len + 2],
        buf[HEADER_SIZE + len + 3],
    ]);
    let computed = frame_checksum(&len_bytes, payload);
    if stored != computed {
        return Err(StorageError::corrupted(
            position,
            format!("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"),
        ));
    }

    Ok(FrameRead::Complete {
        payload,
        encoded_len,
    })
}

fn frame_checksum(len_bytes: &[u8; 4], payload: &[u8]) -> u32 {
    let crc = update_crc32(0xFFFF_FFFF, len_bytes);
    update_crc32(crc, payload) ^ 0xFFFF_FFFF
}
