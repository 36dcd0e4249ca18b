//! Error types for the tablet store.
//!
//! Server-facing failures fall into a few kinds that callers react to
//! differently: *not-loaded* errors mean "retry elsewhere or load first",
//! *cell-data* errors mean a packed buffer was corrupt, and *transaction
//! conflicts* mean the caller should retry with fresh data.

use crate::name::NameError;
use crate::predicate::PredicateError;
use std::fmt;
use std::io;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for tablet store operations.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(io::Error),

    /// Data corruption was detected.
    Corruption(String),

    /// The requested item was not found.
    NotFound(String),

    /// An invalid argument was provided.
    InvalidArgument(String),

    /// The store is in an invalid state.
    InvalidState(String),

    /// A serialization or deserialization error occurred.
    Serialization(String),

    /// A checksum mismatch was detected in an on-disk block.
    ChecksumMismatch {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },

    /// The item already exists.
    AlreadyExists(String),

    /// A background operation was cancelled.
    Cancelled,

    /// The requested scan mode is not supported.
    BadScanMode(i32),

    /// The table is not loaded on this server.
    TableNotLoaded(String),

    /// No loaded tablet covers the requested row.
    TabletNotLoaded(String),

    /// A packed cell buffer has a bad magic number.
    BadMagic,

    /// A packed cell buffer failed checksum verification.
    BadChecksum,

    /// Cells in a packed buffer are not in strictly increasing order.
    BadOrder,

    /// A mutation conflicts with a commit newer than the caller's view.
    MutationConflict,

    /// A scan could not keep a row consistent with its transaction.
    ScanConflict,

    /// A tablet name could not be encoded or decoded.
    BadTabletName(String),

    /// A scan predicate could not be parsed.
    Predicate(PredicateError),

    /// An internal error occurred.
    Internal(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for errors meaning the table or tablet is not resident.
    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Error::TableNotLoaded(_) | Error::TabletNotLoaded(_))
    }

    /// True for packed cell buffer verification failures.
    pub fn is_cell_data_error(&self) -> bool {
        matches!(self, Error::BadMagic | Error::BadChecksum | Error::BadOrder)
    }

    /// True for errors the caller should resolve by retrying with fresh data.
    pub fn is_transaction_conflict(&self) -> bool {
        matches!(self, Error::MutationConflict | Error::ScanConflict)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Corruption(msg) => write!(f, "Data corruption: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::ChecksumMismatch { expected, actual } => {
                write!(f, "Checksum mismatch: expected {:#x}, got {:#x}", expected, actual)
            }
            Error::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::BadScanMode(mode) => write!(f, "Bad scan mode: {}", mode),
            Error::TableNotLoaded(table) => write!(f, "Table not loaded: {}", table),
            Error::TabletNotLoaded(name) => write!(f, "Tablet not loaded: {}", name),
            Error::BadMagic => write!(f, "Cell data error: bad magic"),
            Error::BadChecksum => write!(f, "Cell data error: bad checksum"),
            Error::BadOrder => write!(f, "Cell data error: cells out of order"),
            Error::MutationConflict => write!(f, "Transaction error: mutation conflict"),
            Error::ScanConflict => write!(f, "Transaction error: scan conflict"),
            Error::BadTabletName(msg) => write!(f, "Bad tablet name: {}", msg),
            Error::Predicate(e) => write!(f, "Bad scan predicate: {}", e),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Predicate(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<PredicateError> for Error {
    fn from(err: PredicateError) -> Self {
        Error::Predicate(err)
    }
}

impl From<NameError> for Error {
    fn from(err: NameError) -> Self {
        Error::BadTabletName(err.to_string())
    }
}
