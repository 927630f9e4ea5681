use super::{
    record, CommitId, ConcurrencyControl, ConcurrencyControlInternal, TransactionExecutor,
};
use crate::{Access, AccessSet, Error, Key, Result, StoreOptions, Value};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        Arc,
    },
};

/// Optimistic concurrency control with a global commit log.
///
/// Transactions read committed values without any locking, and are
/// validated against the write sets of the transactions that committed
/// during their read phases.
pub struct Occ<V> {
    log: Mutex<CommitLog>,
    _marker: PhantomData<fn() -> V>,
}

/// OCC that validates and writes in a single critical section.
pub type BackwardOcc = Occ<Backward>;

/// OCC that additionally validates against the transactions that are
/// validating or writing, which allows writes outside the critical section.
pub type ForwardOcc = Occ<Forward>;

impl<V: Validation> ConcurrencyControl for Occ<V> {}

impl<V: Validation> ConcurrencyControlInternal for Occ<V> {
    type Record = Record;
    type Executor<'a> = Executor<'a, V>;

    fn init(_: &StoreOptions) -> Self {
        Self {
            log: Default::default(),
            _marker: PhantomData,
        }
    }

    fn executor<'a>(&'a self, records: &'a [Self::Record]) -> Self::Executor<'a> {
        Self::Executor {
            records,
            log: &self.log,
            start: 0,
            read_set: Vec::new(),
            write_set: Vec::new(),
            footprint: AccessSet::new(),
            registration: None,
            _marker: PhantomData,
        }
    }

    fn committed_value(record: &Self::Record) -> Value {
        record.value.load(SeqCst)
    }

    fn fmt_record(record: &Self::Record, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value={}", record.value.load(SeqCst))
    }
}

#[derive(Default)]
pub struct Record {
    value: AtomicU64,
}

#[derive(Default)]
struct CommitLog {
    /// The number of entries that were pruned from the front of `entries`.
    base: u64,

    /// Write sets of the committed transactions in commit order.
    entries: VecDeque<Arc<AccessSet>>,

    /// Log positions at which in-flight transactions started, with
    /// the number of transactions that started at each position.
    starts: BTreeMap<u64, usize>,

    /// Write sets of the transactions that passed validation but have not
    /// been appended to `entries` yet.
    active: Vec<(u64, Arc<AccessSet>)>,
    next_registration: u64,
}

impl CommitLog {
    fn end(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    /// Entries committed at or after the log position `start`.
    fn since(&self, start: u64) -> impl Iterator<Item = &Arc<AccessSet>> {
        self.entries.range((start - self.base) as usize..)
    }

    fn append(&mut self, write_set: Arc<AccessSet>) -> CommitId {
        self.entries.push_back(write_set);
        CommitId(self.end())
    }

    fn deregister(&mut self, registration: &mut Option<u64>) {
        if let Some(registration) = registration.take() {
            self.active.retain(|&(id, _)| id != registration);
        }
    }

    /// Drops the entries that no in-flight transaction validates against.
    fn prune(&mut self) {
        let oldest = self.starts.keys().next().copied().unwrap_or(self.end());
        while self.base < oldest {
            self.entries.pop_front();
            self.base += 1;
        }
    }
}

pub struct Executor<'a, V> {
    // Global state
    records: &'a [Record],
    log: &'a Mutex<CommitLog>,

    // Per-transaction state
    start: u64,
    read_set: Vec<(Key, Value)>,
    write_set: Vec<(Key, Value)>,
    footprint: AccessSet,
    registration: Option<u64>,

    _marker: PhantomData<fn() -> V>,
}

impl<V> Executor<'_, V> {
    /// Keys written by the transaction.
    fn written_keys(&self) -> Arc<AccessSet> {
        let mut keys = AccessSet::new();
        for &(key, _) in &self.write_set {
            keys.insert(key, Access::WRITE);
        }
        Arc::new(keys)
    }

    fn apply_writes(&self) {
        for &(key, value) in &self.write_set {
            self.records[key].value.store(value, SeqCst);
        }
    }
}

impl<V: Validation> TransactionExecutor for Executor<'_, V> {
    fn begin_transaction(&mut self, _: &AccessSet) -> Result<()> {
        self.read_set.clear();
        self.write_set.clear();
        self.footprint.clear();

        let mut log = self.log.lock();
        self.start = log.end();
        *log.starts.entry(self.start).or_default() += 1;
        Ok(())
    }

    fn end_transaction(&mut self) {
        let mut log = self.log.lock();
        let count = log
            .starts
            .get_mut(&self.start)
            .expect("transaction was not started");
        *count -= 1;
        if *count == 0 {
            log.starts.remove(&self.start);
            log.prune();
        }
    }

    fn read(&mut self, key: Key) -> Result<Value> {
        // Ensures read-your-writes.
        if let Some(&(_, value)) = self.write_set.iter().find(|(k, _)| *k == key) {
            return Ok(value);
        }

        // Ensures repeatable reads.
        if let Some(&(_, value)) = self.read_set.iter().find(|(k, _)| *k == key) {
            return Ok(value);
        }

        let value = record(self.records, key)?.value.load(SeqCst);
        self.read_set.push((key, value));
        self.footprint.insert(key, Access::READ);
        Ok(value)
    }

    fn write(&mut self, key: Key, value: Value) -> Result<()> {
        record(self.records, key)?;
        self.footprint.insert(key, Access::WRITE);
        match self.write_set.iter_mut().find(|(k, _)| *k == key) {
            Some(item) => item.1 = value,
            None => self.write_set.push((key, value)),
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<CommitId> {
        V::commit(self)
    }

    fn abort(&mut self) {
        if self.registration.is_some() {
            self.log.lock().deregister(&mut self.registration);
        }
    }
}

/// The validation scheme of [`Occ`].
pub trait Validation: Send + Sync + Sized + 'static {
    fn commit(executor: &mut Executor<'_, Self>) -> Result<CommitId>;
}

pub enum Backward {}

impl Validation for Backward {
    fn commit(executor: &mut Executor<'_, Self>) -> Result<CommitId> {
        let written_keys = executor.written_keys();

        let mut log = executor.log.lock();
        let conflicts = log
            .since(executor.start)
            .any(|committed| executor.footprint.reads_any_written_by(committed));
        if conflicts {
            return Err(Error::Conflict);
        }

        executor.apply_writes();
        Ok(log.append(written_keys))
    }
}

pub enum Forward {}

impl Validation for Forward {
    fn commit(executor: &mut Executor<'_, Self>) -> Result<CommitId> {
        let written_keys = executor.written_keys();

        let log = executor.log;
        let (committed, active) = {
            let mut log = log.lock();
            let committed: Vec<_> = log.since(executor.start).cloned().collect();
            let active: Vec<_> = log.active.iter().map(|(_, keys)| keys.clone()).collect();

            let registration = log.next_registration;
            log.next_registration += 1;
            log.active.push((registration, written_keys.clone()));
            executor.registration = Some(registration);

            (committed, active)
        };

        let footprint = &executor.footprint;
        let conflicts = committed
            .iter()
            .any(|committed| footprint.reads_any_written_by(committed))
            || active
                .iter()
                .any(|active| footprint.touches_any_written_by(active));
        if conflicts {
            // Deregistered by `abort`.
            return Err(Error::Conflict);
        }

        // Transactions that overlap with the writes either already passed
        // validation against this one or will fail validation.
        executor.apply_writes();

        let mut log = log.lock();
        log.deregister(&mut executor.registration);
        Ok(log.append(written_keys))
    }
}

#[cfg(test)]
mod tests {
    use super::{BackwardOcc, ForwardOcc, Occ, Validation};
    use crate::{Access, AccessSet, Error, Store};
    use std::sync::Arc;

    fn stale_read_aborts<V: Validation>() {
        let store = Store::<Occ<V>>::new(2);
        let mut worker1 = store.worker();
        let mut worker2 = store.worker();

        let mut txn1 = worker1.begin_transaction(&AccessSet::new()).unwrap();
        let value = txn1.read(0).unwrap();

        let mut txn2 = worker2.begin_transaction(&AccessSet::new()).unwrap();
        txn2.write(0, 10).unwrap();
        assert_eq!(txn2.commit().unwrap().0, 1);

        txn1.write(1, value + 1).unwrap();
        assert!(matches!(txn1.commit(), Err(Error::Conflict)));
        assert_eq!(store.committed_value(1).unwrap(), 0);
    }

    fn disjoint_commits<V: Validation>() {
        let store = Store::<Occ<V>>::new(2);
        let mut worker1 = store.worker();
        let mut worker2 = store.worker();

        let mut txn1 = worker1.begin_transaction(&AccessSet::new()).unwrap();
        let value = txn1.read(0).unwrap();
        assert_eq!(txn1.read(0).unwrap(), value);

        let mut txn2 = worker2.begin_transaction(&AccessSet::new()).unwrap();
        txn2.read(1).unwrap();
        txn2.write(1, 5).unwrap();
        assert_eq!(txn2.read(1).unwrap(), 5);
        txn2.commit().unwrap();

        // A blind write of a key written in between doesn't conflict.
        txn1.write(1, 7).unwrap();
        assert_eq!(txn1.commit().unwrap().0, 2);
        assert_eq!(store.committed_value(1).unwrap(), 7);
        assert_eq!(store.dump().to_string(), "0: value=0\n1: value=7\n");
    }

    fn log_is_pruned<V: Validation>() {
        let store = Store::<Occ<V>>::new(1);
        let mut worker1 = store.worker();
        let mut worker2 = store.worker();

        let long = worker1.begin_transaction(&AccessSet::new()).unwrap();
        for i in 0..3 {
            let mut txn = worker2.begin_transaction(&AccessSet::new()).unwrap();
            txn.write(0, i).unwrap();
            txn.commit().unwrap();
        }
        {
            let log = store.concurrency_control.log.lock();
            assert_eq!(log.entries.len(), 3);
            assert_eq!(log.base, 0);
        }

        long.abort();
        let log = store.concurrency_control.log.lock();
        assert!(log.entries.is_empty());
        assert_eq!(log.base, 3);
        assert!(log.starts.is_empty());
    }

    #[test]
    fn backward() {
        stale_read_aborts::<super::Backward>();
        disjoint_commits::<super::Backward>();
        log_is_pruned::<super::Backward>();
    }

    #[test]
    fn forward() {
        stale_read_aborts::<super::Forward>();
        disjoint_commits::<super::Forward>();
        log_is_pruned::<super::Forward>();
    }

    fn simulate_active(store: &Store<ForwardOcc>, key: usize) {
        let mut log = store.concurrency_control.log.lock();
        let mut keys = AccessSet::new();
        keys.insert(key, Access::WRITE);
        let registration = log.next_registration;
        log.next_registration += 1;
        log.active.push((registration, Arc::new(keys)));
    }

    #[test]
    fn forward_validates_against_active() {
        let store = Store::<ForwardOcc>::new(3);
        let mut worker = store.worker();

        simulate_active(&store, 0);

        // Read-write intersection
        let mut txn = worker.begin_transaction(&AccessSet::new()).unwrap();
        txn.read(0).unwrap();
        txn.write(1, 1).unwrap();
        assert!(matches!(txn.commit(), Err(Error::Conflict)));

        // Write-write intersection
        let mut txn = worker.begin_transaction(&AccessSet::new()).unwrap();
        txn.write(0, 1).unwrap();
        assert!(matches!(txn.commit(), Err(Error::Conflict)));

        // Disjoint
        let mut txn = worker.begin_transaction(&AccessSet::new()).unwrap();
        txn.read(2).unwrap();
        txn.write(1, 1).unwrap();
        txn.commit().unwrap();

        // Aborted transactions leave the active set.
        assert_eq!(store.concurrency_control.log.lock().active.len(), 1);
    }

    #[test]
    fn backward_ignores_active() {
        let store = Store::<BackwardOcc>::new(1);
        store
            .concurrency_control
            .log
            .lock()
            .active
            .push((0, Arc::new(AccessSet::new())));

        let mut worker = store.worker();
        let mut txn = worker.begin_transaction(&AccessSet::new()).unwrap();
        txn.write(0, 1).unwrap();
        txn.commit().unwrap();
    }
}
