mod access;
mod concurrency_control;
mod lock;
mod slotted_cell;
mod tid;
mod transaction;
mod worker;

pub use access::{Access, AccessSet, Key, Operation, OperationKind, Value};
pub use concurrency_control::{
    BackwardOcc, CommitId, ConcurrencyControl, ForwardOcc, LockFreeMvto, Mvto, Silo,
    TwoPhaseLocking,
};
pub use transaction::Transaction;
pub use worker::{Execution, Worker, WorkerStats};

use std::{fmt, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serialization failure. The transaction was aborted and may be retried.
    #[error("serialization failure")]
    Conflict,

    /// The key is outside of the key domain of the store.
    #[error("key {0} is out of range")]
    KeyOutOfRange(Key),

    /// The key was accessed without being declared in the access set given
    /// at the beginning of the transaction, or was written while declared
    /// as read-only.
    #[error("key {0} was accessed without being declared")]
    UndeclaredAccess(Key),

    /// Attempted to perform an operation on an aborted transaction.
    #[error("attempted to perform an operation on the aborted transaction")]
    AlreadyAborted,

    /// The transaction kept conflicting and the retry budget ran out.
    #[error("transaction aborted {attempts} times in a row")]
    RetryLimitExceeded { attempts: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    keys: usize,
    gc_threshold: u64,
    abort_backoff: Duration,
    max_retries: Option<u64>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            keys: 10,
            gc_threshold: 10,
            abort_backoff: Duration::from_micros(1),
            max_retries: None,
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a store whose records are all initialized to zero.
    pub fn open<C: ConcurrencyControl>(self) -> Store<C> {
        let records = (0..self.keys).map(|_| Default::default()).collect();
        Store {
            records,
            concurrency_control: C::init(&self),
            options: self,
        }
    }

    /// The number of records, addressed by keys in `0..n`. Defaults to 10.
    pub const fn keys(mut self, n: usize) -> Self {
        self.keys = n;
        self
    }

    /// Multi-version protocols collect obsolete versions when the low-water
    /// mark advances by more than this number of timestamps at once.
    /// Defaults to 10.
    pub const fn gc_threshold(mut self, timestamps: u64) -> Self {
        self.gc_threshold = timestamps;
        self
    }

    /// The upper bound of the randomized sleep before an aborted transaction
    /// is retried by [`Worker::execute`]. Defaults to 1 microsecond.
    pub const fn abort_backoff(mut self, duration: Duration) -> Self {
        self.abort_backoff = duration;
        self
    }

    /// The number of times [`Worker::execute`] retries an aborted
    /// transaction before giving up. Defaults to `None`, which retries
    /// forever.
    pub const fn max_retries(mut self, n: Option<u64>) -> Self {
        self.max_retries = n;
        self
    }
}

pub struct Store<C: ConcurrencyControl> {
    records: Box<[C::Record]>,
    concurrency_control: C,
    options: StoreOptions,
}

static_assertions::assert_impl_all!(Store<Mvto>: Send, Sync);
static_assertions::assert_impl_all!(Store<LockFreeMvto>: Send, Sync);
static_assertions::assert_impl_all!(Store<BackwardOcc>: Send, Sync);
static_assertions::assert_impl_all!(Store<ForwardOcc>: Send, Sync);
static_assertions::assert_impl_all!(Store<Silo>: Send, Sync);
static_assertions::assert_impl_all!(Store<TwoPhaseLocking>: Send, Sync);

impl<C: ConcurrencyControl> Store<C> {
    /// Creates a store of `keys` records with default options.
    pub fn new(keys: usize) -> Self {
        StoreOptions::new().keys(keys).open()
    }

    pub fn options() -> StoreOptions {
        StoreOptions::new()
    }

    /// Spawns a [`Worker`], which can be used to perform transactions.
    ///
    /// You usually should spawn one [`Worker`] per thread, and reuse the
    /// [`Worker`] for multiple transactions.
    pub fn worker(&self) -> Worker<C> {
        Worker::new(
            self.concurrency_control.executor(&self.records),
            &self.options,
        )
    }

    /// The number of records in the store.
    pub fn num_keys(&self) -> usize {
        self.records.len()
    }

    /// Returns the latest committed value of the record.
    pub fn committed_value(&self, key: Key) -> Result<Value> {
        let record = self.records.get(key).ok_or(Error::KeyOutOfRange(key))?;
        Ok(C::committed_value(record))
    }

    /// Returns how many times obsolete versions were garbage collected.
    ///
    /// Always zero for single-version protocols.
    pub fn gc_count(&self) -> u64 {
        self.concurrency_control.gc_count()
    }

    /// Returns a human-readable dump of the protocol state of every record.
    pub fn dump(&self) -> Dump<C> {
        Dump { store: self }
    }
}

pub struct Dump<'a, C: ConcurrencyControl> {
    store: &'a Store<C>,
}

impl<C: ConcurrencyControl> fmt::Display for Dump<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, record) in self.store.records.iter().enumerate() {
            write!(f, "{key}: ")?;
            C::fmt_record(record, f)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
