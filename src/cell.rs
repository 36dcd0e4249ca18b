//! Cells and cell keys.
//!
//! A cell is a versioned `(row, column, timestamp) -> value` record. A cell
//! without a value is an erasure: it shadows the exact key it names and sorts
//! exactly like a live cell at that key.
//!
//! Keys order by row ascending, column ascending, then timestamp
//! **descending**, so the newest version of a column comes first.

use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

/// Approximate per-cell bookkeeping cost used for memory accounting.
pub const CELL_OVERHEAD: usize = 6 * std::mem::size_of::<usize>();

/// The `(row, column, timestamp)` triple identifying a cell version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    row: Bytes,
    column: Bytes,
    timestamp: i64,
}

impl CellKey {
    /// Create a key from its parts.
    pub fn new(row: impl Into<Bytes>, column: impl Into<Bytes>, timestamp: i64) -> Self {
        Self { row: row.into(), column: column.into(), timestamp }
    }

    /// The row.
    pub fn row(&self) -> &Bytes {
        &self.row
    }

    /// The column, `family:qualifier` by convention.
    pub fn column(&self) -> &Bytes {
        &self.column
    }

    /// The timestamp.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The column family, i.e. the column up to the first `:`.
    pub fn column_family(&self) -> &[u8] {
        column_family(&self.column)
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Return the family portion of a column name.
///
/// A column without a `:` is its own family.
pub fn column_family(column: &[u8]) -> &[u8] {
    match column.iter().position(|&b| b == b':') {
        Some(pos) => &column[..pos],
        None => column,
    }
}

/// A versioned cell or an erasure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    key: CellKey,
    value: Option<Bytes>,
}

impl Cell {
    /// A live cell.
    pub fn new(
        row: impl Into<Bytes>,
        column: impl Into<Bytes>,
        timestamp: i64,
        value: impl Into<Bytes>,
    ) -> Self {
        Self { key: CellKey::new(row, column, timestamp), value: Some(value.into()) }
    }

    /// An erasure at the given key.
    pub fn erasure(row: impl Into<Bytes>, column: impl Into<Bytes>, timestamp: i64) -> Self {
        Self { key: CellKey::new(row, column, timestamp), value: None }
    }

    /// Build a cell from a key and an optional value.
    pub fn from_key(key: CellKey, value: Option<Bytes>) -> Self {
        Self { key, value }
    }

    /// The cell key.
    pub fn key(&self) -> &CellKey {
        &self.key
    }

    /// The row.
    pub fn row(&self) -> &Bytes {
        &self.key.row
    }

    /// The column.
    pub fn column(&self) -> &Bytes {
        &self.key.column
    }

    /// The timestamp.
    pub fn timestamp(&self) -> i64 {
        self.key.timestamp
    }

    /// The value, or `None` for an erasure.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// True if this cell erases its key.
    pub fn is_erasure(&self) -> bool {
        self.value.is_none()
    }

    /// Split into key and value.
    pub fn into_parts(self) -> (CellKey, Option<Bytes>) {
        (self.key, self.value)
    }

    /// Approximate in-memory footprint of the cell.
    pub fn memory_size(&self) -> usize {
        CELL_OVERHEAD
            + self.key.row.len()
            + self.key.column.len()
            + self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Bytes of user data carried by the cell.
    pub fn data_size(&self) -> usize {
        self.key.row.len() + self.key.column.len() + self.value.as_ref().map_or(0, |v| v.len())
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},",
            String::from_utf8_lossy(&self.key.row),
            String::from_utf8_lossy(&self.key.column),
            self.key.timestamp
        )?;
        match &self.value {
            Some(v) => write!(f, "{})", String::from_utf8_lossy(v)),
            None => write!(f, "ERASED)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_timestamp_sorts_descending() {
        let newer = CellKey::new("a", "b:c", 45);
        let older = CellKey::new("a", "b:c", 42);
        assert!(newer < older);
    }

    #[test]
    fn test_row_then_column() {
        assert!(CellKey::new("a", "z", 0) < CellKey::new("b", "a", 100));
        assert!(CellKey::new("a", "a", 0) < CellKey::new("a", "b", 100));
    }

    #[test]
    fn test_erasure_orders_like_cell() {
        let live = Cell::new("m", "n:o", 42, "v");
        let dead = Cell::erasure("m", "n:o", 42);
        assert_eq!(live.key().cmp(dead.key()), Ordering::Equal);
        assert!(dead.is_erasure());
        assert!(!live.is_erasure());
    }

    #[test]
    fn test_empty_value_is_not_erasure() {
        let cell = Cell::new("foo", "dingo", 3, "");
        assert!(!cell.is_erasure());
        assert_eq!(cell.value().map(|v| v.len()), Some(0));
    }

    #[test]
    fn test_column_family() {
        assert_eq!(column_family(b"fam:qual"), b"fam");
        assert_eq!(column_family(b"fam:"), b"fam");
        assert_eq!(column_family(b"plain"), b"plain");
        assert_eq!(CellKey::new("r", "a:b:c", 1).column_family(), b"a");
    }

    #[test]
    fn test_display() {
        assert_eq!(Cell::new("a", "b:c", 42, "v1").to_string(), "(a,b:c,42,v1)");
        assert_eq!(Cell::erasure("m", "n:o", 42).to_string(), "(m,n:o,42,ERASED)");
    }

    proptest! {
        #[test]
        fn prop_order_is_total_and_consistent(
            a in (prop::collection::vec(any::<u8>(), 0..4), prop::collection::vec(any::<u8>(), 0..4), any::<i64>()),
            b in (prop::collection::vec(any::<u8>(), 0..4), prop::collection::vec(any::<u8>(), 0..4), any::<i64>()),
        ) {
            let ka = CellKey::new(a.0.clone(), a.1.clone(), a.2);
            let kb = CellKey::new(b.0.clone(), b.1.clone(), b.2);
            prop_assert_eq!(ka.cmp(&kb), kb.cmp(&ka).reverse());
            prop_assert_eq!(ka.cmp(&kb) == Ordering::Equal, ka == kb);
            let expected = a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(b.2.cmp(&a.2));
            prop_assert_eq!(ka.cmp(&kb), expected);
        }
    }
}
