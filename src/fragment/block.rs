//! Cell block encoding for disk fragments.
//!
//! A block holds cells in key order with the row prefix shared between
//! neighbouring entries.
//!
//! Entry format:
//! ```text
//! [shared_row_len: u32]     // Row bytes shared with the previous entry
//! [unshared_row_len: u32]   // Length of the row suffix
//! [column_len: u32]
//! [value_len: u32]
//! [timestamp: i64]
//! [flags: u8]               // bit 0 set = erasure
//! [row suffix] [column] [value]
//! ```
//!
//! On disk each encoded block is followed by a trailer:
//! `[compression_type: u8][crc32: u32]`, the checksum covering the stored
//! (possibly compressed) bytes.

use crate::cell::{Cell, CellKey};
use crate::config::CompressionType;
use crate::error::{Error, Result};
use crate::filter::{BloomFilter, Filter};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const ENTRY_HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 1;
const FLAG_ERASURE: u8 = 0x01;

/// Size of the compression and checksum trailer after each stored block.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Summary of a finished block, used to build its index entry.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    /// Key of the first cell.
    pub first_key: CellKey,
    /// Row of the last cell.
    pub last_row: Bytes,
    /// Smallest timestamp in the block.
    pub min_timestamp: i64,
    /// Largest timestamp in the block.
    pub max_timestamp: i64,
    /// Number of cells, erasures included.
    pub cell_count: u32,
    /// Number of erasures.
    pub erasure_count: u32,
    /// Filter over the column families present.
    pub family_filter: BloomFilter,
}

/// Builds one block of cells.
#[derive(Debug)]
pub struct BlockBuilder {
    buffer: BytesMut,
    last_row: Bytes,
    first_key: Option<CellKey>,
    min_timestamp: i64,
    max_timestamp: i64,
    cell_count: u32,
    erasure_count: u32,
    family_filter: BloomFilter,
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            last_row: Bytes::new(),
            first_key: None,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            cell_count: 0,
            erasure_count: 0,
            family_filter: BloomFilter::for_families(),
        }
    }

    /// Add a cell. The caller guarantees key order.
    ///
    /// Fails without changing the block if a field is too long for its
    /// `u32` length header.
    pub fn add(&mut self, key: &CellKey, value: Option<&Bytes>) -> Result<()> {
        let row = key.row();
        let shared = if self.first_key.is_some() { shared_prefix_len(&self.last_row, row) } else { 0 };
        let value_bytes: &[u8] = value.map(|v| v.as_ref()).unwrap_or(&[]);
        let shared_len = field_len(shared, "row")?;
        let unshared_len = field_len(row.len() - shared, "row")?;
        let column_len = field_len(key.column().len(), "column")?;
        let value_len = field_len(value_bytes.len(), "value")?;

        self.buffer.put_u32_le(shared_len);
        self.buffer.put_u32_le(unshared_len);
        self.buffer.put_u32_le(column_len);
        self.buffer.put_u32_le(value_len);
        self.buffer.put_i64_le(key.timestamp());
        self.buffer.put_u8(if value.is_none() { FLAG_ERASURE } else { 0 });
        self.buffer.put_slice(&row[shared..]);
        self.buffer.put_slice(key.column());
        self.buffer.put_slice(value_bytes);

        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        self.last_row = row.clone();
        self.min_timestamp = self.min_timestamp.min(key.timestamp());
        self.max_timestamp = self.max_timestamp.max(key.timestamp());
        self.cell_count += 1;
        if value.is_none() {
            self.erasure_count += 1;
        }
        self.family_filter.add(key.column_family());
        Ok(())
    }

    /// Get the current encoded size of the block.
    pub fn current_size(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the block is empty
    pub fn is_empty(&self) -> bool {
        self.cell_count == 0
    }

    /// Finish the block, returning its raw encoding and summary.
    ///
    /// Returns `None` for an empty builder.
    pub fn finish(self) -> Option<(Bytes, BlockSummary)> {
        let first_key = self.first_key?;
        let summary = BlockSummary {
            first_key,
            last_row: self.last_row,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            cell_count: self.cell_count,
            erasure_count: self.erasure_count,
            family_filter: self.family_filter,
        };
        Some((self.buffer.freeze(), summary))
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn field_len(len: usize, field: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::invalid_argument(format!("{} of {} bytes is too long for a block", field, len)))
}

/// Decode a raw block into cells.
pub fn decode_block(mut data: Bytes) -> Result<Vec<Cell>> {
    let mut cells = Vec::new();
    let mut last_row: Bytes = Bytes::new();
    while data.has_remaining() {
        if data.remaining() < ENTRY_HEADER_SIZE {
            return Err(Error::corruption("truncated block entry header"));
        }
        let shared = data.get_u32_le() as usize;
        let unshared = data.get_u32_le() as usize;
        let column_len = data.get_u32_le() as usize;
        let value_len = data.get_u32_le() as usize;
        let timestamp = data.get_i64_le();
        let flags = data.get_u8();
        if shared > last_row.len() {
            return Err(Error::corruption("block entry shares more than the previous row"));
        }
        let body = unshared
            .checked_add(column_len)
            .and_then(|n| n.checked_add(value_len))
            .ok_or_else(|| Error::corruption("block entry length overflow"))?;
        if data.remaining() < body {
            return Err(Error::corruption("truncated block entry"));
        }
        let suffix = data.split_to(unshared);
        let row = if shared == 0 {
            suffix
        } else if unshared == 0 && shared == last_row.len() {
            last_row.clone()
        } else {
            let mut row = BytesMut::with_capacity(shared + unshared);
            row.put_slice(&last_row[..shared]);
            row.put_slice(&suffix);
            row.freeze()
        };
        let column = data.split_to(column_len);
        let value = data.split_to(value_len);
        last_row = row.clone();
        let key = CellKey::new(row, column, timestamp);
        let value = if flags & FLAG_ERASURE != 0 { None } else { Some(value) };
        cells.push(Cell::from_key(key, value));
    }
    Ok(cells)
}

/// Compress a raw block and append the trailer.
pub fn seal_block(raw: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    let mut stored = match compression {
        CompressionType::None => raw.to_vec(),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(raw)
            .map_err(|e| Error::internal(format!("Compression failed: {}", e)))?,
        #[cfg(feature = "lz4-compression")]
        CompressionType::Lz4 => lz4::block::compress(raw, None, true)
            .map_err(|e| Error::internal(format!("Compression failed: {}", e)))?,
    };
    let checksum = crc32fast::hash(&stored);
    stored.push(compression as u8);
    stored.extend_from_slice(&checksum.to_le_bytes());
    Ok(stored)
}

/// Verify the trailer of a stored block and return its raw encoding.
pub fn unseal_block(stored: &[u8]) -> Result<Bytes> {
    if stored.len() < BLOCK_TRAILER_SIZE {
        return Err(Error::corruption("Block size too small"));
    }
    let data_size = stored.len() - BLOCK_TRAILER_SIZE;
    let data = &stored[..data_size];
    let compression_type = stored[data_size];
    let mut raw_checksum = [0u8; 4];
    raw_checksum.copy_from_slice(&stored[data_size + 1..]);
    let expected = u32::from_le_bytes(raw_checksum);
    let actual = crc32fast::hash(data);
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    let compression = CompressionType::from_u8(compression_type)
        .ok_or_else(|| Error::corruption("Invalid compression type"))?;
    let raw = match compression {
        CompressionType::None => data.to_vec(),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::corruption(format!("Decompression failed: {}", e)))?,
        #[cfg(feature = "lz4-compression")]
        CompressionType::Lz4 => lz4::block::decompress(data, None)
            .map_err(|e| Error::corruption(format!("Decompression failed: {}", e)))?,
    };
    Ok(Bytes::from(raw))
}
