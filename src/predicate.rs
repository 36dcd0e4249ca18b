//! Scan predicates.
//!
//! A [`ScanPredicate`] restricts a scan by row, column and timestamp ranges,
//! optionally by column family, and carries a history limit. Predicates can
//! be built programmatically or parsed from text:
//!
//! ```text
//! row >= "a" and row < "m" and column ~= "fam:" and time > @100
//! "a" <= row < "m" or row = "z"
//! history = 2
//! ```

use crate::cell::{column_family, CellKey};
use crate::interval::{Interval, IntervalSet};
use bytes::Bytes;
use std::fmt;
use std::ops::Bound;

/// Errors produced while parsing a predicate expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    /// Input ended in the middle of an expression.
    #[error("unexpected end of predicate")]
    UnexpectedEnd,
    /// A token appeared where it is not allowed.
    #[error("unexpected token '{token}' at offset {offset}")]
    UnexpectedToken {
        /// Token text.
        token: String,
        /// Byte offset into the input.
        offset: usize,
    },
    /// A quoted string was not closed.
    #[error("unterminated string at offset {0}")]
    UnterminatedString(usize),
    /// A backslash escape could not be decoded.
    #[error("bad escape sequence at offset {0}")]
    BadEscape(usize),
    /// An integer literal could not be parsed.
    #[error("bad integer literal '{0}'")]
    BadInteger(String),
    /// The field name is not `row`, `column` or `time`.
    #[error("unknown field '{0}'")]
    UnknownField(String),
    /// The literal type does not fit the field.
    #[error("field '{field}' expects a {expected} literal")]
    LiteralType {
        /// Field name.
        field: &'static str,
        /// Expected literal kind.
        expected: &'static str,
    },
    /// Intervals joined by `or` name different fields.
    #[error("cannot mix fields '{0}' and '{1}' in one disjunction")]
    MixedFields(&'static str, &'static str),
    /// The operator cannot be used in this position.
    #[error("operator '{0}' not allowed here")]
    BadOperator(&'static str),
    /// `history` was given more than once.
    #[error("history specified more than once")]
    DuplicateHistory,
}

/// Restriction applied to a scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanPredicate {
    rows: Option<IntervalSet<Bytes>>,
    columns: Option<IntervalSet<Bytes>>,
    times: Option<IntervalSet<i64>>,
    families: Option<Vec<Bytes>>,
    max_history: i32,
}

impl ScanPredicate {
    /// A predicate that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a predicate expression.
    pub fn parse(text: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(text)?;
        Parser { tokens, pos: 0 }.parse()
    }

    /// Restrict rows to the given set.
    pub fn with_rows(mut self, rows: IntervalSet<Bytes>) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Restrict columns to the given set.
    pub fn with_columns(mut self, columns: IntervalSet<Bytes>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Restrict timestamps to the given set.
    pub fn with_times(mut self, times: IntervalSet<i64>) -> Self {
        self.times = Some(times);
        self
    }

    /// Restrict the scan to the given column families.
    pub fn with_column_families<I, B>(mut self, families: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut fams: Vec<Bytes> = families.into_iter().map(Into::into).collect();
        fams.sort();
        fams.dedup();
        self.families = Some(fams);
        self
    }

    /// Set the per-column history limit. Zero means unlimited.
    pub fn with_max_history(mut self, history: i32) -> Self {
        self.max_history = history;
        self
    }

    /// Row restriction, if any.
    pub fn rows(&self) -> Option<&IntervalSet<Bytes>> {
        self.rows.as_ref()
    }

    /// Column restriction, if any.
    pub fn columns(&self) -> Option<&IntervalSet<Bytes>> {
        self.columns.as_ref()
    }

    /// Timestamp restriction, if any.
    pub fn times(&self) -> Option<&IntervalSet<i64>> {
        self.times.as_ref()
    }

    /// Column families the scan is restricted to, if known.
    pub fn column_families(&self) -> Option<&[Bytes]> {
        self.families.as_deref()
    }

    /// History limit; zero means every version.
    pub fn max_history(&self) -> i32 {
        self.max_history
    }

    /// The row set, treating "no restriction" as everything.
    pub fn row_set(&self) -> IntervalSet<Bytes> {
        self.rows.clone().unwrap_or_else(IntervalSet::all)
    }

    /// True if the row restriction excludes every row.
    pub fn has_no_rows(&self) -> bool {
        self.rows.as_ref().is_some_and(|r| r.is_empty())
    }

    /// Return a copy with rows restricted to `interval`.
    pub fn clip_rows(&self, interval: &Interval<Bytes>) -> Self {
        let mut clipped = self.clone();
        clipped.rows = Some(self.row_set().clipped(interval));
        clipped
    }

    /// Return a copy restricted to the intersection of its families and
    /// `families`.
    pub fn restrict_families(&self, families: &[Bytes]) -> Self {
        let mut restricted = self.clone();
        let fams: Vec<Bytes> = match &self.families {
            Some(existing) => existing.iter().filter(|f| families.contains(f)).cloned().collect(),
            None => families.to_vec(),
        };
        restricted.families = Some(fams);
        restricted
    }

    /// True if the row passes the row restriction.
    pub fn matches_row(&self, row: &Bytes) -> bool {
        self.rows.as_ref().map_or(true, |r| r.contains(row))
    }

    /// True if the key passes every restriction.
    pub fn matches(&self, key: &CellKey) -> bool {
        self.matches_row(key.row())
            && self.columns.as_ref().map_or(true, |c| c.contains(key.column()))
            && self.times.as_ref().map_or(true, |t| t.contains(&key.timestamp()))
            && self
                .families
                .as_ref()
                .map_or(true, |f| f.iter().any(|fam| fam.as_ref() == key.column_family()))
    }
}

impl fmt::Display for ScanPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(rows) = &self.rows {
            parts.push(render_set("row", rows, |v| quote(v), quote(b"")));
        }
        if let Some(columns) = &self.columns {
            parts.push(render_set("column", columns, |v| quote(v), quote(b"")));
        }
        if let Some(times) = &self.times {
            parts.push(render_set("time", times, |v| format!("@{}", v), format!("@{}", i64::MIN)));
        }
        if self.max_history != 0 {
            parts.push(format!("history = {}", self.max_history));
        }
        write!(f, "{}", parts.join(" and "))
    }
}

fn render_set<T, F>(field: &str, set: &IntervalSet<T>, lit: F, min_lit: String) -> String
where
    T: Ord + Clone,
    F: Fn(&T) -> String,
{
    if set.is_empty() {
        // Nothing sorts below the minimum literal.
        return format!("{} < {}", field, min_lit);
    }
    let rendered: Vec<String> = set
        .iter()
        .map(|i| match (i.lower(), i.upper()) {
            (Bound::Included(a), Bound::Included(b)) if a == b => {
                format!("{} = {}", field, lit(a))
            }
            (Bound::Unbounded, Bound::Unbounded) => format!("{} >= {}", field, min_lit),
            (lo, Bound::Unbounded) => format!("{} {} {}", field, lower_op(lo), bound_lit(lo, &lit)),
            (Bound::Unbounded, hi) => format!("{} {} {}", field, upper_op(hi), bound_lit(hi, &lit)),
            (lo, hi) => format!(
                "{} {} {} {} {}",
                bound_lit(lo, &lit),
                flip(lower_op(lo)),
                field,
                upper_op(hi),
                bound_lit(hi, &lit)
            ),
        })
        .collect();
    rendered.join(" or ")
}

fn lower_op<T>(b: &Bound<T>) -> &'static str {
    match b {
        Bound::Excluded(_) => ">",
        _ => ">=",
    }
}

fn upper_op<T>(b: &Bound<T>) -> &'static str {
    match b {
        Bound::Excluded(_) => "<",
        _ => "<=",
    }
}

fn flip(op: &'static str) -> &'static str {
    match op {
        ">" => "<",
        _ => "<=",
    }
}

fn bound_lit<T, F: Fn(&T) -> String>(b: &Bound<T>, lit: &F) -> String {
    match b {
        Bound::Included(v) | Bound::Excluded(v) => lit(v),
        Bound::Unbounded => String::new(),
    }
}

fn quote(v: &[u8]) -> String {
    let mut s = String::from("\"");
    for &b in v {
        match b {
            b'"' => s.push_str("\\\""),
            b'\\' => s.push_str("\\\\"),
            b'\n' => s.push_str("\\n"),
            b'\t' => s.push_str("\\t"),
            0x20..=0x7e => s.push(b as char),
            _ => s.push_str(&format!("\\x{:02x}", b)),
        }
    }
    s.push('"');
    s
}

/// Smallest byte string greater than every string with the given prefix,
/// or `None` if no such string exists.
fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(Bytes::from(end));
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Prefix,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "=",
            Op::Prefix => "~=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(String),
    Str(Vec<u8>),
    Int(i64),
    Op(Op),
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Word(w) => write!(f, "{}", w),
            Tok::Str(s) => write!(f, "{}", quote(s)),
            Tok::Int(i) => write!(f, "{}", i),
            Tok::Op(op) => write!(f, "{}", op.as_str()),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<(Tok, usize)>, PredicateError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'<' | b'>' | b'=' | b'~' => {
                let next = bytes.get(i + 1).copied();
                let (op, len) = match (c, next) {
                    (b'<', Some(b'=')) => (Op::Le, 2),
                    (b'<', _) => (Op::Lt, 1),
                    (b'>', Some(b'=')) => (Op::Ge, 2),
                    (b'>', _) => (Op::Gt, 1),
                    (b'=', _) => (Op::Eq, 1),
                    (b'~', Some(b'=')) => (Op::Prefix, 2),
                    _ => {
                        return Err(PredicateError::UnexpectedToken {
                            token: (c as char).to_string(),
                            offset: i,
                        })
                    }
                };
                out.push((Tok::Op(op), start));
                i += len;
            }
            b'"' | b'\'' => {
                let (s, end) = read_string(bytes, i)?;
                out.push((Tok::Str(s), start));
                i = end;
            }
            b'@' | b'-' | b'0'..=b'9' => {
                let mut j = if c == b'@' { i + 1 } else { i };
                let digits_start = j;
                if bytes.get(j) == Some(&b'-') {
                    j += 1;
                }
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                let lit = &text[digits_start..j];
                let value =
                    lit.parse::<i64>().map_err(|_| PredicateError::BadInteger(lit.to_string()))?;
                out.push((Tok::Int(value), start));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let mut j = i;
                while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                    j += 1;
                }
                out.push((Tok::Word(text[i..j].to_ascii_lowercase()), start));
                i = j;
            }
            _ => {
                return Err(PredicateError::UnexpectedToken {
                    token: (c as char).to_string(),
                    offset: i,
                })
            }
        }
    }
    Ok(out)
}

fn read_string(bytes: &[u8], start: usize) -> Result<(Vec<u8>, usize), PredicateError> {
    let quote_char = bytes[start];
    let mut out = Vec::new();
    let mut i = start + 1;
    while i < bytes.len() {
        let c = bytes[i];
        if c == quote_char {
            return Ok((out, i + 1));
        }
        if c == b'\\' {
            let esc = *bytes.get(i + 1).ok_or(PredicateError::UnterminatedString(start))?;
            match esc {
                b'n' => out.push(b'\n'),
                b't' => out.push(b'\t'),
                b'r' => out.push(b'\r'),
                b'0' => out.push(0),
                b'\\' | b'"' | b'\'' => out.push(esc),
                b'x' => {
                    let hex = bytes.get(i + 2..i + 4).ok_or(PredicateError::BadEscape(i))?;
                    let hex = std::str::from_utf8(hex).map_err(|_| PredicateError::BadEscape(i))?;
                    let v = u8::from_str_radix(hex, 16).map_err(|_| PredicateError::BadEscape(i))?;
                    out.push(v);
                    i += 2;
                }
                _ => return Err(PredicateError::BadEscape(i)),
            }
            i += 2;
        } else {
            out.push(c);
            i += 1;
        }
    }
    Err(PredicateError::UnterminatedString(start))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Row,
    Column,
    Time,
}

impl Field {
    fn name(self) -> &'static str {
        match self {
            Field::Row => "row",
            Field::Column => "column",
            Field::Time => "time",
        }
    }
}

enum Lit {
    Str(Bytes),
    Int(i64),
}

enum Parsed {
    Bytes(Interval<Bytes>, Option<Bytes>),
    Time(Interval<i64>),
}

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
}

impl Parser {
    fn parse(mut self) -> Result<ScanPredicate, PredicateError> {
        let mut pred = ScanPredicate::new();
        let mut history_seen = false;
        if self.tokens.is_empty() {
            return Ok(pred);
        }
        loop {
            if self.peek_word("history") {
                self.pos += 1;
                self.expect_op(Op::Eq)?;
                let n = match self.next()? {
                    (Tok::Int(n), _) => n,
                    (tok, offset) => return Err(unexpected(tok, offset)),
                };
                if history_seen {
                    return Err(PredicateError::DuplicateHistory);
                }
                history_seen = true;
                pred.max_history = i32::try_from(n)
                    .map_err(|_| PredicateError::BadInteger(n.to_string()))?;
            } else {
                self.parse_disjunction(&mut pred)?;
            }
            match self.tokens.get(self.pos) {
                None => break,
                Some((Tok::Word(w), _)) if w == "and" => self.pos += 1,
                Some((tok, offset)) => return Err(unexpected(tok.clone(), *offset)),
            }
        }
        Ok(pred)
    }

    fn parse_disjunction(&mut self, pred: &mut ScanPredicate) -> Result<(), PredicateError> {
        let mut field: Option<Field> = None;
        let mut bytes_set = IntervalSet::new();
        let mut time_set = IntervalSet::new();
        let mut families: Option<Vec<Bytes>> = Some(Vec::new());
        loop {
            let (f, parsed) = self.parse_interval()?;
            if let Some(prev) = field {
                if prev != f {
                    return Err(PredicateError::MixedFields(prev.name(), f.name()));
                }
            }
            field = Some(f);
            match parsed {
                Parsed::Bytes(interval, family) => {
                    bytes_set.add(interval);
                    match (family, families.as_mut()) {
                        (Some(fam), Some(list)) => list.push(fam),
                        _ => families = None,
                    }
                }
                Parsed::Time(interval) => time_set.add(interval),
            }
            if self.peek_word("or") {
                self.pos += 1;
            } else {
                break;
            }
        }
        match field {
            Some(Field::Row) => {
                pred.rows = Some(match pred.rows.take() {
                    Some(existing) => existing.intersect(&bytes_set),
                    None => bytes_set,
                });
            }
            Some(Field::Column) => {
                pred.columns = Some(match pred.columns.take() {
                    Some(existing) => existing.intersect(&bytes_set),
                    None => bytes_set,
                });
                if let Some(mut fams) = families {
                    fams.sort();
                    fams.dedup();
                    pred.families = Some(match pred.families.take() {
                        Some(existing) => {
                            existing.into_iter().filter(|f| fams.contains(f)).collect()
                        }
                        None => fams,
                    });
                }
            }
            Some(Field::Time) => {
                pred.times = Some(match pred.times.take() {
                    Some(existing) => existing.intersect(&time_set),
                    None => time_set,
                });
            }
            None => return Err(PredicateError::UnexpectedEnd),
        }
        Ok(())
    }

    fn parse_interval(&mut self) -> Result<(Field, Parsed), PredicateError> {
        if self.peek_literal() {
            // LIT op FIELD op LIT
            let lo = self.literal()?;
            let lo_op = self.op()?;
            let field = self.field()?;
            let hi_op = self.op()?;
            let hi = self.literal()?;
            let lower_inclusive = match lo_op {
                Op::Lt => false,
                Op::Le => true,
                other => return Err(PredicateError::BadOperator(other.as_str())),
            };
            let upper_inclusive = match hi_op {
                Op::Lt => false,
                Op::Le => true,
                other => return Err(PredicateError::BadOperator(other.as_str())),
            };
            return match field {
                Field::Time => {
                    let lo = expect_int(field, lo)?;
                    let hi = expect_int(field, hi)?;
                    Ok((field, Parsed::Time(Interval::new(
                        bound(lo, lower_inclusive),
                        bound(hi, upper_inclusive),
                    ))))
                }
                _ => {
                    let lo = expect_str(field, lo)?;
                    let hi = expect_str(field, hi)?;
                    Ok((field, Parsed::Bytes(
                        Interval::new(bound(lo, lower_inclusive), bound(hi, upper_inclusive)),
                        None,
                    )))
                }
            };
        }

        // FIELD op LIT
        let field = self.field()?;
        let op = self.op()?;
        let lit = self.literal()?;
        match field {
            Field::Time => {
                let v = expect_int(field, lit)?;
                let interval = match op {
                    Op::Lt => Interval::all().with_upper(Bound::Excluded(v)),
                    Op::Le => Interval::all().with_upper(Bound::Included(v)),
                    Op::Gt => Interval::all().with_lower(Bound::Excluded(v)),
                    Op::Ge => Interval::at_least(v),
                    Op::Eq => Interval::point(v),
                    Op::Prefix => return Err(PredicateError::BadOperator(op.as_str())),
                };
                Ok((field, Parsed::Time(interval)))
            }
            _ => {
                let v = expect_str(field, lit)?;
                let mut family = None;
                let interval = match op {
                    Op::Lt => Interval::all().with_upper(Bound::Excluded(v)),
                    Op::Le => Interval::all().with_upper(Bound::Included(v)),
                    Op::Gt => Interval::all().with_lower(Bound::Excluded(v)),
                    Op::Ge => Interval::at_least(v),
                    Op::Eq => {
                        if field == Field::Column && v.contains(&b':') {
                            family = Some(Bytes::copy_from_slice(column_family(&v)));
                        }
                        Interval::point(v)
                    }
                    Op::Prefix => {
                        if field == Field::Column && v.contains(&b':') {
                            family = Some(Bytes::copy_from_slice(column_family(&v)));
                        }
                        let upper = match prefix_successor(&v) {
                            Some(end) => Bound::Excluded(end),
                            None => Bound::Unbounded,
                        };
                        Interval::new(Bound::Included(v), upper)
                    }
                };
                Ok((field, Parsed::Bytes(interval, family)))
            }
        }
    }

    fn next(&mut self) -> Result<(Tok, usize), PredicateError> {
        let tok = self.tokens.get(self.pos).cloned().ok_or(PredicateError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn peek_word(&self, word: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some((Tok::Word(w), _)) if w == word)
    }

    fn peek_literal(&self) -> bool {
        matches!(self.tokens.get(self.pos), Some((Tok::Str(_), _)) | Some((Tok::Int(_), _)))
    }

    fn expect_op(&mut self, op: Op) -> Result<(), PredicateError> {
        match self.next()? {
            (Tok::Op(o), _) if o == op => Ok(()),
            (tok, offset) => Err(unexpected(tok, offset)),
        }
    }

    fn op(&mut self) -> Result<Op, PredicateError> {
        match self.next()? {
            (Tok::Op(o), _) => Ok(o),
            (tok, offset) => Err(unexpected(tok, offset)),
        }
    }

    fn field(&mut self) -> Result<Field, PredicateError> {
        match self.next()? {
            (Tok::Word(w), _) => match w.as_str() {
                "row" => Ok(Field::Row),
                "column" => Ok(Field::Column),
                "time" => Ok(Field::Time),
                _ => Err(PredicateError::UnknownField(w)),
            },
            (tok, offset) => Err(unexpected(tok, offset)),
        }
    }

    fn literal(&mut self) -> Result<Lit, PredicateError> {
        match self.tokens.get(self.pos).cloned() {
            Some((Tok::Str(s), _)) => {
                self.pos += 1;
                Ok(Lit::Str(Bytes::from(s)))
            }
            Some((Tok::Int(i), _)) => {
                self.pos += 1;
                Ok(Lit::Int(i))
            }
            Some((tok, offset)) => Err(unexpected(tok, offset)),
            None => Err(PredicateError::UnexpectedEnd),
        }
    }
}

fn unexpected(tok: Tok, offset: usize) -> PredicateError {
    PredicateError::UnexpectedToken { token: tok.to_string(), offset }
}

fn bound<T>(v: T, inclusive: bool) -> Bound<T> {
    if inclusive {
        Bound::Included(v)
    } else {
        Bound::Excluded(v)
    }
}

fn expect_int(field: Field, lit: Lit) -> Result<i64, PredicateError> {
    match lit {
        Lit::Int(i) => Ok(i),
        Lit::Str(_) => Err(PredicateError::LiteralType { field: field.name(), expected: "time" }),
    }
}

fn expect_str(field: Field, lit: Lit) -> Result<Bytes, PredicateError> {
    match lit {
        Lit::Str(s) => Ok(s),
        Lit::Int(_) => Err(PredicateError::LiteralType { field: field.name(), expected: "string" }),
    }
}
