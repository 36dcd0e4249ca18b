//! Disk fragment trailer.
//!
//! The trailer is a fixed-size (24 bytes) structure at the end of a fragment
//! file that locates the block index.

use crate::error::{Error, Result};

/// Magic number closing every disk fragment file.
pub const FRAGMENT_MAGIC: u64 = 0x4b44_4946_5241_4731; // "KDIFRAG1"

/// Size of the encoded trailer.
pub const TRAILER_SIZE: usize = 24;

/// BlockHandle represents a pointer to a region of a fragment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Offset of the block in the file
    pub offset: u64,
    /// Size of the block in bytes
    pub size: u64,
}

impl BlockHandle {
    /// Create a new BlockHandle
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Get the end offset of this block
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// Trailer is the last 24 bytes of a fragment file.
///
/// Format:
/// ```text
/// [index_offset: u64]
/// [index_size: u64]
/// [magic: u64]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    /// Handle to the index record
    pub index_handle: BlockHandle,
}

impl Trailer {
    /// Create a new Trailer
    pub fn new(index_handle: BlockHandle) -> Self {
        Self { index_handle }
    }

    /// Encode the trailer to bytes
    pub fn encode(&self) -> [u8; TRAILER_SIZE] {
        let mut buf = [0u8; TRAILER_SIZE];
        buf[0..8].copy_from_slice(&self.index_handle.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index_handle.size.to_le_bytes());
        buf[16..24].copy_from_slice(&FRAGMENT_MAGIC.to_le_bytes());
        buf
    }

    /// Decode a trailer, validating it against the file size.
    pub fn decode(data: &[u8], file_size: u64) -> Result<Self> {
        if data.len() != TRAILER_SIZE {
            return Err(Error::corruption(format!(
                "Trailer size mismatch: expected {}, got {}",
                TRAILER_SIZE,
                data.len()
            )));
        }
        let magic = read_u64(&data[16..24]);
        if magic != FRAGMENT_MAGIC {
            return Err(Error::corruption(format!(
                "Invalid fragment magic number: expected {:#x}, got {:#x}",
                FRAGMENT_MAGIC, magic
            )));
        }
        let index_handle = BlockHandle::new(read_u64(&data[0..8]), read_u64(&data[8..16]));
        let limit = file_size.saturating_sub(TRAILER_SIZE as u64);
        if index_handle.offset > limit || index_handle.size > limit - index_handle.offset {
            return Err(Error::corruption("fragment index lies outside the file"));
        }
        Ok(Self { index_handle })
    }
}

fn read_u64(data: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(data);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailer_round_trip() {
        let trailer = Trailer::new(BlockHandle::new(1000, 200));
        let encoded = trailer.encode();
        assert_eq!(Trailer::decode(&encoded, 1224).unwrap(), trailer);
    }

    #[test]
    fn test_bad_magic() {
        let mut encoded = Trailer::new(BlockHandle::new(0, 10)).encode();
        encoded[20] ^= 1;
        assert!(Trailer::decode(&encoded, 100).is_err());
    }

    #[test]
    fn test_index_out_of_range() {
        let encoded = Trailer::new(BlockHandle::new(1000, 200)).encode();
        assert!(Trailer::decode(&encoded, 1100).is_err());
        assert!(Trailer::decode(&encoded[..10], 1224).is_err());
    }
}
