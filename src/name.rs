//! Tablet name encoding.
//!
//! A tablet is named by its table and the inclusive upper bound of its row
//! range: `"table lastRow"`, or `"table!"` when the range is unbounded above.

/// Errors produced by tablet name encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The table name is empty.
    #[error("empty table name")]
    EmptyTable,
    /// The table name contains a character outside `[a-zA-Z0-9/_-]`.
    #[error("invalid character {0:?} in table name")]
    BadTableChar(char),
    /// The name has no `' '` or `'!'` separator after the table.
    #[error("missing row separator in tablet name {0:?}")]
    MissingSeparator(String),
    /// Text follows the `'!'` marker.
    #[error("trailing text after '!' in tablet name {0:?}")]
    TrailingText(String),
    /// The row bound is not valid UTF-8.
    #[error("row bound is not valid UTF-8")]
    BadRow,
}

/// True if `c` may appear in a table name.
pub fn is_table_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '/' || c == '-' || c == '_'
}

/// Check that a table name is non-empty and uses only table characters.
pub fn validate_table_name(table: &str) -> Result<(), NameError> {
    if table.is_empty() {
        return Err(NameError::EmptyTable);
    }
    match table.chars().find(|&c| !is_table_char(c)) {
        Some(c) => Err(NameError::BadTableChar(c)),
        None => Ok(()),
    }
}

/// Encode a tablet name from its table and optional inclusive last row.
pub fn encode_tablet_name(table: &str, last_row: Option<&[u8]>) -> Result<String, NameError> {
    validate_table_name(table)?;
    match last_row {
        None => Ok(format!("{}!", table)),
        Some(row) => {
            let row = std::str::from_utf8(row).map_err(|_| NameError::BadRow)?;
            Ok(format!("{} {}", table, row))
        }
    }
}

/// Return the table portion of a tablet name.
pub fn table_of(tablet: &str) -> Result<&str, NameError> {
    let end = tablet.find(|c: char| !is_table_char(c));
    match end {
        Some(0) => Err(NameError::EmptyTable),
        None if tablet.is_empty() => Err(NameError::EmptyTable),
        None => Err(NameError::MissingSeparator(tablet.to_string())),
        Some(pos) => match tablet[pos..].chars().next() {
            Some(' ') => Ok(&tablet[..pos]),
            Some('!') if pos + 1 == tablet.len() => Ok(&tablet[..pos]),
            Some('!') => Err(NameError::TrailingText(tablet.to_string())),
            Some(c) => Err(NameError::BadTableChar(c)),
            None => Err(NameError::MissingSeparator(tablet.to_string())),
        },
    }
}

/// Decode a tablet name into its table and optional inclusive last row.
pub fn decode_tablet_name(tablet: &str) -> Result<(String, Option<Vec<u8>>), NameError> {
    let table = table_of(tablet)?;
    let rest = &tablet[table.len()..];
    if rest == "!" {
        Ok((table.to_string(), None))
    } else {
        Ok((table.to_string(), Some(rest[1..].as_bytes().to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(encode_tablet_name("foo", None).unwrap(), "foo!");
        assert_eq!(encode_tablet_name("a/b-c_d", Some(b"row")).unwrap(), "a/b-c_d row");
        assert_eq!(encode_tablet_name("t", Some(b"")).unwrap(), "t ");
        assert_eq!(encode_tablet_name("", None), Err(NameError::EmptyTable));
        assert_eq!(encode_tablet_name("a b", None), Err(NameError::BadTableChar(' ')));
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode_tablet_name("foo!").unwrap(), ("foo".to_string(), None));
        assert_eq!(
            decode_tablet_name("foo some row").unwrap(),
            ("foo".to_string(), Some(b"some row".to_vec()))
        );
        assert_eq!(decode_tablet_name("t ").unwrap(), ("t".to_string(), Some(Vec::new())));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode_tablet_name(""), Err(NameError::EmptyTable));
        assert_eq!(decode_tablet_name("!"), Err(NameError::EmptyTable));
        assert!(matches!(decode_tablet_name("foo"), Err(NameError::MissingSeparator(_))));
        assert!(matches!(decode_tablet_name("foo!x"), Err(NameError::TrailingText(_))));
        assert_eq!(decode_tablet_name("foo#bar"), Err(NameError::BadTableChar('#')));
    }

    #[test]
    fn test_round_trip() {
        for (table, row) in [("t1", None), ("t/2", Some(&b"zz top"[..]))] {
            let name = encode_tablet_name(table, row).unwrap();
            let (t, r) = decode_tablet_name(&name).unwrap();
            assert_eq!(t, table);
            assert_eq!(r.as_deref(), row);
        }
    }
}
