//! Checksum utilities for CHFS
//!
//! Every on-media structure (eraseblock headers, record headers, record
//! bodies, names and data payloads) is protected by a CRC-32 (IEEE 802.3 polynomial).

use crate::error::{Error, Result};

/// Compute the CRC-32 of a byte slice
#[inline]
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compute the CRC-32 over several slices as if they were concatenated
#[must_use]
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Verify that `data` hashes to `expected`
pub fn verify_crc32(data: &[u8], expected: u32) -> Result<()> {
    let actual = crc32(data);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch { expected, actual })
    }
}
