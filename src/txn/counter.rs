//! Commit numbering and durability watermarks.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

/// Callback fired once a watermark reaches its wait transaction.
///
/// Called with `(wait_txn, watermark)`.
pub type TxnCallback = Box<dyn FnOnce(i64, i64) + Send>;

struct Waiter {
    txn: i64,
    seq: u64,
    callback: TxnCallback,
}

// Reversed so that BinaryHeap pops the smallest (txn, seq) first.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.txn, other.seq).cmp(&(self.txn, self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.txn == other.txn && self.seq == other.seq
    }
}

impl Eq for Waiter {}

#[derive(Default)]
struct Watermark {
    last: i64,
    waiters: BinaryHeap<Waiter>,
}

impl Watermark {
    fn advance(&mut self, txn: i64, last_commit: i64, what: &str) -> Result<Option<DeferredCallbacks>> {
        if txn <= self.last {
            return Err(Error::invalid_argument(format!(
                "{} txn {} does not advance past {}",
                what, txn, self.last
            )));
        }
        if txn > last_commit {
            return Err(Error::invalid_argument(format!(
                "{} txn {} is beyond last commit {}",
                what, txn, last_commit
            )));
        }
        self.last = txn;

        let mut ready = Vec::new();
        while self.waiters.peek().is_some_and(|w| w.txn <= txn) {
            if let Some(waiter) = self.waiters.pop() {
                ready.push((waiter.txn, waiter.callback));
            }
        }
        if ready.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DeferredCallbacks { ready, last: txn }))
        }
    }

    fn defer(&mut self, callback: TxnCallback, wait_txn: i64, seq: u64, what: &str) -> Result<()> {
        if wait_txn <= self.last {
            return Err(Error::invalid_argument(format!(
                "{} wait txn {} already reached ({})",
                what, wait_txn, self.last
            )));
        }
        self.waiters.push(Waiter { txn: wait_txn, seq, callback });
        Ok(())
    }
}

/// Callbacks released by a watermark advance.
///
/// Callers run these after dropping whatever lock guards the counter.
#[must_use = "deferred callbacks do nothing unless run"]
pub struct DeferredCallbacks {
    ready: Vec<(i64, TxnCallback)>,
    last: i64,
}

impl DeferredCallbacks {
    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    /// True when there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Fire every callback in wait order.
    pub fn run(self) {
        let last = self.last;
        for (wait, callback) in self.ready {
            callback(wait, last);
        }
    }
}

impl fmt::Debug for DeferredCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCallbacks")
            .field("count", &self.ready.len())
            .field("last", &self.last)
            .finish()
    }
}

/// Hands out commit numbers and tracks the durable and stable watermarks.
///
/// Not synchronized; owners wrap it in a mutex. `durable <= last_commit`
/// and `stable <= last_commit` always hold.
#[derive(Default)]
pub struct TransactionCounter {
    last_commit: i64,
    durable: Watermark,
    stable: Watermark,
    next_seq: u64,
}

impl TransactionCounter {
    /// A counter with no commits.
    pub fn new() -> Self {
        Self::default()
    }

    /// A counter resuming after `last` committed, durable and stable
    /// transactions.
    pub fn starting_at(last: i64) -> Self {
        let mut counter = Self::new();
        counter.last_commit = last;
        counter.durable.last = last;
        counter.stable.last = last;
        counter
    }

    /// Assign the next commit number.
    pub fn assign_commit(&mut self) -> i64 {
        self.last_commit += 1;
        self.last_commit
    }

    /// Last assigned commit.
    pub fn last_commit(&self) -> i64 {
        self.last_commit
    }

    /// Highest durable commit.
    pub fn last_durable(&self) -> i64 {
        self.durable.last
    }

    /// Highest stable commit.
    pub fn last_stable(&self) -> i64 {
        self.stable.last
    }

    /// Advance the durable watermark to `txn`.
    pub fn set_last_durable(&mut self, txn: i64) -> Result<Option<DeferredCallbacks>> {
        self.durable.advance(txn, self.last_commit, "durable")
    }

    /// Advance the stable watermark to `txn`.
    pub fn set_last_stable(&mut self, txn: i64) -> Result<Option<DeferredCallbacks>> {
        self.stable.advance(txn, self.last_commit, "stable")
    }

    /// Run `callback` once the durable watermark reaches `wait_txn`.
    ///
    /// `wait_txn` must be beyond the current watermark.
    pub fn defer_until_durable(&mut self, callback: TxnCallback, wait_txn: i64) -> Result<()> {
        let seq = self.bump_seq();
        self.durable.defer(callback, wait_txn, seq, "durable")
    }

    /// Run `callback` once the stable watermark reaches `wait_txn`.
    pub fn defer_until_stable(&mut self, callback: TxnCallback, wait_txn: i64) -> Result<()> {
        let seq = self.bump_seq();
        self.stable.defer(callback, wait_txn, seq, "stable")
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

impl fmt::Debug for TransactionCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCounter")
            .field("last_commit", &self.last_commit)
            .field("last_durable", &self.durable.last)
            .field("last_stable", &self.stable.last)
            .finish()
    }
}
