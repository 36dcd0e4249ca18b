//! Transaction bookkeeping.
//!
//! [`TransactionCounter`] is the only source of commit numbers and tracks
//! how far commits have progressed toward durability (written to the log)
//! and stability (serialized into a fragment). [`CommitRing`] remembers the
//! last commit of recently written rows so that conflicting mutations and
//! scans can be detected without keeping unbounded history.

mod counter;
mod ring;

pub use counter::{DeferredCallbacks, TransactionCounter, TxnCallback};
pub use ring::CommitRing;
