use super::{
    record, CommitId, ConcurrencyControl, ConcurrencyControlInternal, TransactionExecutor,
};
use crate::{
    lock::{Lock, ReadGuard, WriteGuard},
    AccessSet, Error, Key, Result, StoreOptions, Value,
};
use std::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicU64, Ordering::SeqCst},
};

/// Pessimistic concurrency control.
///
/// This is an implementation of strong strict two phase locking.
/// All the locks are acquired at the beginning of a transaction in
/// ascending order of keys, so transactions never deadlock nor abort due
/// to conflicts.
pub struct TwoPhaseLocking {
    commit_counter: AtomicU64,
}

impl ConcurrencyControl for TwoPhaseLocking {}

impl ConcurrencyControlInternal for TwoPhaseLocking {
    type Record = Record;
    type Executor<'a> = Executor<'a>;

    fn init(_: &StoreOptions) -> Self {
        Self {
            commit_counter: AtomicU64::new(0),
        }
    }

    fn executor<'a>(&'a self, records: &'a [Self::Record]) -> Self::Executor<'a> {
        Self::Executor {
            records,
            commit_counter: &self.commit_counter,
            working_set: Default::default(),
        }
    }

    fn committed_value(record: &Self::Record) -> Value {
        let _guard = record.lock.read();
        unsafe { record.get() }
    }

    fn fmt_record(record: &Self::Record, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value={}", Self::committed_value(record))
    }
}

#[derive(Default)]
pub struct Record {
    value: UnsafeCell<Value>,
    lock: Lock,
}

unsafe impl Sync for Record {}

impl Record {
    unsafe fn get(&self) -> Value {
        assert!(self.lock.is_locked());
        *self.value.get()
    }

    unsafe fn set(&self, value: Value) {
        assert!(self.lock.is_locked_exclusive());
        *self.value.get() = value;
    }
}

pub struct Executor<'a> {
    // Global state
    records: &'a [Record],
    commit_counter: &'a AtomicU64,

    // Per-transaction state
    working_set: Vec<WorkingItem<'a>>,
}

impl<'a> Executor<'a> {
    fn find_item(&mut self, key: Key) -> Result<&mut WorkingItem<'a>> {
        record(self.records, key)?;

        // The working set is sorted by key.
        let i = self
            .working_set
            .binary_search_by_key(&key, |item| item.key)
            .map_err(|_| Error::UndeclaredAccess(key))?;
        Ok(&mut self.working_set[i])
    }
}

impl TransactionExecutor for Executor<'_> {
    fn begin_transaction(&mut self, access: &AccessSet) -> Result<()> {
        self.working_set.clear();

        // Growing phase
        for (key, access) in access.iter() {
            let record = record(self.records, key)?;
            let guard = if access.writes() {
                Guard::Exclusive(record.lock.write())
            } else {
                Guard::Shared(record.lock.read())
            };
            self.working_set.push(WorkingItem {
                key,
                record,
                guard,
                pending_value: None,
            });
        }
        Ok(())
    }

    fn read(&mut self, key: Key) -> Result<Value> {
        let item = self.find_item(key)?;
        Ok(match item.pending_value {
            Some(value) => value,
            None => unsafe { item.record.get() },
        })
    }

    fn write(&mut self, key: Key, value: Value) -> Result<()> {
        let item = self.find_item(key)?;
        match item.guard {
            Guard::Shared(_) => Err(Error::UndeclaredAccess(key)),
            Guard::Exclusive(_) => {
                item.pending_value = Some(value);
                Ok(())
            }
        }
    }

    fn commit(&mut self) -> Result<CommitId> {
        // Shrinking phase
        for item in &self.working_set {
            if let Some(value) = item.pending_value {
                unsafe { item.record.set(value) };
            }
        }
        let commit_id = self.commit_counter.fetch_add(1, SeqCst) + 1;
        self.working_set.clear();
        Ok(CommitId(commit_id))
    }

    fn abort(&mut self) {
        self.working_set.clear();
    }
}

struct WorkingItem<'a> {
    key: Key,
    record: &'a Record,
    guard: Guard<'a>,
    pending_value: Option<Value>,
}

// Dropping the guard releases the lock.
enum Guard<'a> {
    Shared(#[allow(dead_code)] ReadGuard<'a>),
    Exclusive(#[allow(dead_code)] WriteGuard<'a>),
}

#[cfg(test)]
mod tests {
    use super::TwoPhaseLocking;
    use crate::{Access, AccessSet, Error, Store};

    fn access(entries: &[(usize, Access)]) -> AccessSet {
        let mut set = AccessSet::new();
        for &(key, access) in entries {
            set.insert(key, access);
        }
        set
    }

    #[test]
    fn locks_are_held_until_commit() {
        let store = Store::<TwoPhaseLocking>::new(3);
        let mut worker = store.worker();

        let mut txn = worker
            .begin_transaction(&access(&[(0, Access::READ), (2, Access::READ_WRITE)]))
            .unwrap();
        let lock = |key: usize| &store.records[key].lock;
        assert!(lock(0).is_locked() && !lock(0).is_locked_exclusive());
        assert!(!lock(1).is_locked());
        assert!(lock(2).is_locked_exclusive());
        assert!(lock(0).try_write().is_none());
        assert!(lock(2).try_read().is_none());

        let value = txn.read(2).unwrap();
        txn.write(2, value + 1).unwrap();
        assert_eq!(txn.read(2).unwrap(), 1);
        assert!(lock(2).is_locked_exclusive());
        assert_eq!(txn.commit().unwrap().0, 1);

        assert!((0..3).all(|key| !lock(key).is_locked()));
        assert_eq!(store.committed_value(2).unwrap(), 1);
    }

    #[test]
    fn undeclared_access() {
        let store = Store::<TwoPhaseLocking>::new(3);
        let mut worker = store.worker();

        let mut txn = worker
            .begin_transaction(&access(&[(0, Access::READ)]))
            .unwrap();
        assert!(matches!(txn.read(1), Err(Error::UndeclaredAccess(1))));
        assert!(matches!(txn.read(0), Err(Error::AlreadyAborted)));
        drop(txn);

        let mut txn = worker
            .begin_transaction(&access(&[(0, Access::READ)]))
            .unwrap();
        assert!(matches!(txn.write(0, 1), Err(Error::UndeclaredAccess(0))));
        drop(txn);

        let mut txn = worker
            .begin_transaction(&access(&[(0, Access::READ)]))
            .unwrap();
        assert!(matches!(txn.read(5), Err(Error::KeyOutOfRange(5))));
        drop(txn);

        assert!(matches!(
            worker.begin_transaction(&access(&[(1, Access::WRITE), (3, Access::READ)])),
            Err(Error::KeyOutOfRange(3))
        ));
        assert!((0..3).all(|key| !store.records[key].lock.is_locked()));
    }

    #[test]
    fn abort_discards_writes() {
        let store = Store::<TwoPhaseLocking>::new(1);
        let mut worker = store.worker();

        let mut txn = worker
            .begin_transaction(&access(&[(0, Access::WRITE)]))
            .unwrap();
        txn.write(0, 42).unwrap();
        txn.abort();

        assert!(!store.records[0].lock.is_locked());
        assert_eq!(store.committed_value(0).unwrap(), 0);
        assert_eq!(store.dump().to_string(), "0: value=0\n");
    }
}
