//! Packed cell buffers.
//!
//! Cells travel as a single self-checking buffer: the payload of `apply`,
//! of scan batches and of every commit log entry.
//!
//! Format:
//! ```text
//! [magic: 4 bytes "CPk0"]
//! [checksum: u32]            // CRC32 of everything after this field
//! [cell_count: u32]
//! [cell 1] ... [cell N]
//! ```
//!
//! Each cell:
//! ```text
//! [flags: u8]                // bit 0 set = erasure
//! [row_len: u32] [column_len: u32] [value_len: u32]
//! [timestamp: i64]
//! [row] [column] [value]
//! ```

use crate::cell::{Cell, CellKey};
use crate::error::{Error, Result};
use crate::fragment::CellOutput;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic number at the front of every packed buffer.
pub const PACKED_MAGIC: [u8; 4] = *b"CPk0";

const HEADER_SIZE: usize = 12;
const CELL_HEADER_SIZE: usize = 1 + 4 + 4 + 4 + 8;
const FLAG_ERASURE: u8 = 0x01;

/// Builds a packed cell buffer.
#[derive(Debug)]
pub struct PackedCellWriter {
    buf: BytesMut,
    count: u32,
    data_size: usize,
    last: Option<CellKey>,
}

impl Default for PackedCellWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PackedCellWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(&PACKED_MAGIC);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        Self { buf, count: 0, data_size: 0, last: None }
    }

    /// Append a live cell.
    pub fn append(&mut self, row: &[u8], column: &[u8], timestamp: i64, value: &[u8]) {
        self.put(0, row, column, timestamp, value);
    }

    /// Append an erasure.
    pub fn append_erasure(&mut self, row: &[u8], column: &[u8], timestamp: i64) {
        self.put(FLAG_ERASURE, row, column, timestamp, &[]);
    }

    /// Append a cell of either kind.
    pub fn append_cell(&mut self, cell: &Cell) {
        match cell.value() {
            Some(v) => self.append(cell.row(), cell.column(), cell.timestamp(), v),
            None => self.append_erasure(cell.row(), cell.column(), cell.timestamp()),
        }
    }

    fn put(&mut self, flags: u8, row: &[u8], column: &[u8], timestamp: i64, value: &[u8]) {
        self.buf.put_u8(flags);
        self.buf.put_u32_le(row.len() as u32);
        self.buf.put_u32_le(column.len() as u32);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_i64_le(timestamp);
        self.buf.put_slice(row);
        self.buf.put_slice(column);
        self.buf.put_slice(value);
        self.count += 1;
        self.data_size += row.len() + column.len() + value.len();
        self.last = Some(CellKey::new(
            Bytes::copy_from_slice(row),
            Bytes::copy_from_slice(column),
            timestamp,
        ));
    }

    /// Number of cells appended.
    pub fn cell_count(&self) -> usize {
        self.count as usize
    }

    /// Row of the last appended cell.
    pub fn last_row(&self) -> Option<&[u8]> {
        self.last.as_ref().map(|k| k.row().as_ref())
    }

    /// Column of the last appended cell.
    pub fn last_column(&self) -> Option<&[u8]> {
        self.last.as_ref().map(|k| k.column().as_ref())
    }

    /// Timestamp of the last appended cell.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.last.as_ref().map(|k| k.timestamp())
    }

    /// Current encoded size in bytes.
    pub fn encoded_size(&self) -> usize {
        self.buf.len()
    }

    /// Seal the buffer: fill in the count and checksum.
    pub fn finish(mut self) -> Bytes {
        self.buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        let checksum = crc32fast::hash(&self.buf[8..]);
        self.buf[4..8].copy_from_slice(&checksum.to_le_bytes());
        self.buf.freeze()
    }
}

impl CellOutput for PackedCellWriter {
    fn emit_cell(&mut self, key: &CellKey, value: &Bytes) -> Result<()> {
        self.append(key.row(), key.column(), key.timestamp(), value);
        Ok(())
    }

    fn emit_erasure(&mut self, key: &CellKey) -> Result<()> {
        self.append_erasure(key.row(), key.column(), key.timestamp());
        Ok(())
    }

    fn cell_count(&self) -> usize {
        self.count as usize
    }

    fn data_size(&self) -> usize {
        self.data_size
    }
}

/// Reads cells from a packed buffer.
///
/// The verify methods are independent; `next` assumes `verify_offsets`
/// succeeded and returns `None` at the first malformed cell otherwise.
#[derive(Debug, Clone)]
pub struct PackedCellReader {
    data: Bytes,
    pos: usize,
    remaining: u32,
}

impl PackedCellReader {
    /// Wrap a buffer.
    pub fn new(data: Bytes) -> Self {
        let remaining = if data.len() >= HEADER_SIZE {
            u32::from_le_bytes([data[8], data[9], data[10], data[11]])
        } else {
            0
        };
        Self { data, pos: HEADER_SIZE, remaining }
    }

    /// True if the buffer starts with the packed magic.
    pub fn verify_magic(&self) -> bool {
        self.data.len() >= HEADER_SIZE && self.data[..4] == PACKED_MAGIC
    }

    /// True if the stored checksum matches the contents.
    pub fn verify_checksum(&self) -> bool {
        if self.data.len() < HEADER_SIZE {
            return false;
        }
        let stored = u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        crc32fast::hash(&self.data[8..]) == stored
    }

    /// True if every cell's lengths stay within the buffer and the buffer
    /// holds exactly the advertised number of cells.
    pub fn verify_offsets(&self) -> bool {
        if self.data.len() < HEADER_SIZE {
            return false;
        }
        let mut pos = HEADER_SIZE;
        for _ in 0..self.remaining {
            match cell_extent(&self.data, pos) {
                Some(end) => pos = end,
                None => return false,
            }
        }
        pos == self.data.len()
    }

    /// Number of cells not yet read.
    pub fn remaining(&self) -> usize {
        self.remaining as usize
    }

    /// Read the next cell.
    pub fn next_cell(&mut self) -> Option<Cell> {
        if self.remaining == 0 {
            return None;
        }
        let end = cell_extent(&self.data, self.pos)?;
        let mut hdr = &self.data[self.pos..self.pos + CELL_HEADER_SIZE];
        let flags = hdr.get_u8();
        let row_len = hdr.get_u32_le() as usize;
        let col_len = hdr.get_u32_le() as usize;
        let val_len = hdr.get_u32_le() as usize;
        let timestamp = hdr.get_i64_le();

        let mut at = self.pos + CELL_HEADER_SIZE;
        let row = self.data.slice(at..at + row_len);
        at += row_len;
        let column = self.data.slice(at..at + col_len);
        at += col_len;
        let value = self.data.slice(at..at + val_len);

        self.pos = end;
        self.remaining -= 1;
        let key = CellKey::new(row, column, timestamp);
        if flags & FLAG_ERASURE != 0 {
            Some(Cell::from_key(key, None))
        } else {
            Some(Cell::from_key(key, Some(value)))
        }
    }
}

impl Iterator for PackedCellReader {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        self.next_cell()
    }
}

fn cell_extent(data: &[u8], pos: usize) -> Option<usize> {
    let hdr = data.get(pos..pos.checked_add(CELL_HEADER_SIZE)?)?;
    let row_len = u32::from_le_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as usize;
    let col_len = u32::from_le_bytes([hdr[5], hdr[6], hdr[7], hdr[8]]) as usize;
    let val_len = u32::from_le_bytes([hdr[9], hdr[10], hdr[11], hdr[12]]) as usize;
    let end = pos
        .checked_add(CELL_HEADER_SIZE)?
        .checked_add(row_len)?
        .checked_add(col_len)?
        .checked_add(val_len)?;
    if end <= data.len() {
        Some(end)
    } else {
        None
    }
}

/// Pack a slice of cells.
pub fn pack_cells<'a>(cells: impl IntoIterator<Item = &'a Cell>) -> Bytes {
    let mut writer = PackedCellWriter::new();
    for cell in cells {
        writer.append_cell(cell);
    }
    writer.finish()
}

/// Verify and decode a packed buffer.
///
/// With `require_order`, cells must be in strictly increasing key order.
pub fn unpack_cells(data: Bytes, require_order: bool) -> Result<Vec<Cell>> {
    let reader = PackedCellReader::new(data);
    if !reader.verify_magic() {
        return Err(Error::BadMagic);
    }
    if !reader.verify_checksum() {
        return Err(Error::BadChecksum);
    }
    if !reader.verify_offsets() {
        return Err(Error::corruption("packed cell offsets out of range"));
    }
    let cells: Vec<Cell> = reader.collect();
    if require_order && cells.windows(2).any(|w| w[0].key() >= w[1].key()) {
        return Err(Error::BadOrder);
    }
    Ok(cells)
}
