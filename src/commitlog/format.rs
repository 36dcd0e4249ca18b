//! Commit log framing.
//!
//! File header:
//! ```text
//! [magic: u32 "KLOG"] [version: u32]
//! ```
//!
//! Entry:
//! ```text
//! [magic: u32 "KLE0"]
//! [name_len: u32]
//! [data_len: u32]
//! [checksum: u32]      // CRC32 of name_len || data_len || name
//! [name: name_len bytes]
//! [data: data_len bytes]
//! ```
//!
//! All integers are little-endian.

/// Magic number at the start of every log file.
pub const LOG_MAGIC: u32 = u32::from_le_bytes(*b"KLOG");

/// Current log file version.
pub const LOG_VERSION: u32 = 0;

/// Magic number at the start of every entry.
pub const ENTRY_MAGIC: u32 = u32::from_le_bytes(*b"KLE0");

/// Size of the file header.
pub const FILE_HEADER_SIZE: usize = 8;

/// Size of an entry header.
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Longest table name an entry may carry.
pub const MAX_NAME_LEN: usize = 1024;

/// Largest payload an entry may carry.
pub const MAX_DATA_LEN: usize = 64 * 1024 * 1024;

/// Encode the file header.
pub fn encode_file_header() -> [u8; FILE_HEADER_SIZE] {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&LOG_VERSION.to_le_bytes());
    buf
}

/// True if `buf` is a valid file header of a supported version.
pub fn check_file_header(buf: &[u8; FILE_HEADER_SIZE]) -> bool {
    read_u32(&buf[0..4]) == LOG_MAGIC && read_u32(&buf[4..8]) == LOG_VERSION
}

/// Header of one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Length of the table name.
    pub name_len: u32,
    /// Length of the packed cell payload.
    pub data_len: u32,
    /// CRC32 of the lengths and the name.
    pub checksum: u32,
}

impl EntryHeader {
    /// Build the header for an entry.
    pub fn new(name: &[u8], data_len: usize) -> Self {
        let name_len = name.len() as u32;
        let data_len = data_len as u32;
        Self { name_len, data_len, checksum: entry_checksum(name_len, data_len, name) }
    }

    /// Encode the header.
    pub fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..4].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.name_len.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Decode a header, returning `None` on a bad magic number or a length
    /// beyond the limits.
    pub fn decode(buf: &[u8; ENTRY_HEADER_SIZE]) -> Option<Self> {
        if read_u32(&buf[0..4]) != ENTRY_MAGIC {
            return None;
        }
        let header = Self {
            name_len: read_u32(&buf[4..8]),
            data_len: read_u32(&buf[8..12]),
            checksum: read_u32(&buf[12..16]),
        };
        if header.name_len as usize > MAX_NAME_LEN || header.data_len as usize > MAX_DATA_LEN {
            return None;
        }
        Some(header)
    }

    /// True if the stored checksum matches `name`.
    pub fn verify(&self, name: &[u8]) -> bool {
        entry_checksum(self.name_len, self.data_len, name) == self.checksum
    }

    /// Bytes the entry occupies, header included.
    pub fn entry_size(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64 + self.name_len as u64 + self.data_len as u64
    }
}

fn entry_checksum(name_len: u32, data_len: u32, name: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&name_len.to_le_bytes());
    hasher.update(&data_len.to_le_bytes());
    hasher.update(name);
    hasher.finalize()
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}
