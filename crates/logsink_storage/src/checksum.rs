//! CRC-32 (IEEE) used to protect frames.

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Computes the CRC-32 checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    update_crc32(0xFFFF_FFFF, data) ^ 0xFFFF_FFFF
}

/// Folds `data` into a running (pre-inverted) checksum.
pub(crate) fn update_crc32(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    crc
}
