mod mvto;
mod occ;
mod silo;
mod two_phase_locking;

pub use mvto::{LockFreeMvto, Mvto};
pub use occ::{BackwardOcc, ForwardOcc};
pub use silo::Silo;
pub use two_phase_locking::TwoPhaseLocking;

use crate::{AccessSet, Error, Key, Result, StoreOptions, Value};
use std::fmt;

/// Identifies a committed transaction.
///
/// Commit identifiers are never reused within a store. Their meaning is
/// protocol-defined: a timestamp for MVTO, a position in the commit log for
/// OCC, a TID for Silo, and a commit sequence number for 2PL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId(pub u64);

/// Concurrency control protocol.
pub trait ConcurrencyControl: ConcurrencyControlInternal {}

pub trait ConcurrencyControlInternal: Send + Sync + Sized + 'static {
    type Record: Default + Send + Sync;
    type Executor<'a>: TransactionExecutor + 'a
    where
        Self: 'a;

    /// Initializes the protocol-wide state of a store.
    fn init(options: &StoreOptions) -> Self;

    fn executor<'a>(&'a self, records: &'a [Self::Record]) -> Self::Executor<'a>;

    /// Returns the latest committed value of `record`.
    fn committed_value(record: &Self::Record) -> Value;

    fn fmt_record(record: &Self::Record, f: &mut fmt::Formatter<'_>) -> fmt::Result;

    fn gc_count(&self) -> u64 {
        0
    }
}

pub trait TransactionExecutor {
    /// Called before calls to other methods when a transaction begins.
    ///
    /// `access` declares every key the transaction is going to touch.
    fn begin_transaction(&mut self, access: &AccessSet) -> Result<()>;

    /// Called after
    /// - a successful call to `commit`
    /// - a call to `abort`.
    fn end_transaction(&mut self) {}

    /// Reads the value of a record in the transaction.
    fn read(&mut self, key: Key) -> Result<Value>;

    /// Writes a value of a record in the transaction.
    fn write(&mut self, key: Key, value: Value) -> Result<()>;

    /// Attempts to commit the transaction.
    fn commit(&mut self) -> Result<CommitId>;

    /// Aborts the transaction.
    ///
    /// Called when a user requests an abort, or when `Err` is returned from
    /// `begin_transaction`, `read`, `write`, or `commit`.
    fn abort(&mut self);
}

fn record<T>(records: &[T], key: Key) -> Result<&T> {
    records.get(key).ok_or(Error::KeyOutOfRange(key))
}
