use super::{
    record, CommitId, ConcurrencyControl, ConcurrencyControlInternal, TransactionExecutor,
};
use crate::{
    slotted_cell::{Slot, SlottedCell},
    tid::{Tid, TidGenerator},
    AccessSet, Error, Key, Result, StoreOptions, Value,
};
use crossbeam_utils::{Backoff, CachePadded};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering::SeqCst},
};

/// Optimistic concurrency control with per-record TIDs and latches.
///
/// This is an implementation of [Silo](https://doi.org/10.1145/2517349.2522713)
/// without the epoch-based group commit.
pub struct Silo {
    /// The last TID generated by each worker slot.
    last_tids: SlottedCell<CachePadded<AtomicU64>>,
}

impl ConcurrencyControl for Silo {}

impl ConcurrencyControlInternal for Silo {
    type Record = Record;
    type Executor<'a> = Executor<'a>;

    fn init(_: &StoreOptions) -> Self {
        Self {
            last_tids: Default::default(),
        }
    }

    fn executor<'a>(&'a self, records: &'a [Self::Record]) -> Self::Executor<'a> {
        let last_tid = self
            .last_tids
            .alloc_with(|_| AtomicU64::new(Tid::ZERO.0).into());
        let tid_generator = TidGenerator::new(last_tid.index(), Tid(last_tid.load(SeqCst)));
        Self::Executor {
            records,
            last_tid,
            tid_generator,
            read_set: Default::default(),
            write_set: Default::default(),
        }
    }

    fn committed_value(record: &Self::Record) -> Value {
        record.read().value
    }

    fn fmt_record(record: &Self::Record, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let RecordSnapshot { value, tid } = record.read();
        write!(f, "value={value} tid={}:{}", tid.sequence(), tid.worker())
    }
}

#[derive(Default)]
pub struct Record {
    value: AtomicU64,
    tid: AtomicU64,
}

impl Record {
    /// Acquires the latch of the record.
    ///
    /// Returns the TID before the locking operation.
    fn lock(&self) -> Tid {
        let backoff = Backoff::new();
        loop {
            let current_tid = Tid(self.tid.load(SeqCst));
            if current_tid.is_locked() {
                backoff.snooze();
                continue;
            }

            let result = self.tid.compare_exchange_weak(
                current_tid.0,
                current_tid.with_locked().0,
                SeqCst,
                SeqCst,
            );
            if result.is_ok() {
                return current_tid;
            }
            backoff.spin();
        }
    }

    /// Releases the latch without changing the TID.
    fn unlock(&self) {
        let tid = Tid(self.tid.load(SeqCst));
        assert!(tid.is_locked(), "record is not latched");
        self.tid.store(tid.without_locked().0, SeqCst);
    }

    /// Optimistically reads the record.
    fn read(&self) -> RecordSnapshot {
        let backoff = Backoff::new();
        loop {
            let tid1 = Tid(self.tid.load(SeqCst));
            if tid1.is_locked() {
                backoff.snooze();
                continue;
            }

            let value = self.value.load(SeqCst);

            let tid2 = Tid(self.tid.load(SeqCst));
            if tid1 == tid2 {
                return RecordSnapshot { value, tid: tid2 };
            }
            backoff.spin();
        }
    }
}

struct RecordSnapshot {
    value: Value,
    tid: Tid,
}

pub struct Executor<'a> {
    // Global state
    records: &'a [Record],

    // Per-executor state
    last_tid: Slot<'a, CachePadded<AtomicU64>>,
    tid_generator: TidGenerator,

    // Per-transaction state
    read_set: Vec<ReadItem>,
    write_set: Vec<WriteItem>,
}

impl TransactionExecutor for Executor<'_> {
    fn begin_transaction(&mut self, _: &AccessSet) -> Result<()> {
        self.read_set.clear();
        self.write_set.clear();
        Ok(())
    }

    fn read(&mut self, key: Key) -> Result<Value> {
        // Ensures read-your-writes.
        let item = self.write_set.iter().find(|item| item.key == key);
        if let Some(item) = item {
            return Ok(item.value);
        }

        // Ensures repeatable reads.
        let item = self.read_set.iter().find(|item| item.key == key);
        if let Some(item) = item {
            return Ok(item.value);
        }

        let RecordSnapshot { value, tid } = record(self.records, key)?.read();
        self.read_set.push(ReadItem { key, value, tid });
        Ok(value)
    }

    fn write(&mut self, key: Key, value: Value) -> Result<()> {
        record(self.records, key)?;

        let item = self.read_set.iter_mut().find(|item| item.key == key);
        if let Some(item) = item {
            // The record will be latched by this transaction at validation.
            item.tid = item.tid.with_locked();
        }

        let item = self.write_set.iter_mut().find(|item| item.key == key);
        if let Some(item) = item {
            item.value = value;
            return Ok(());
        }

        self.write_set.push(WriteItem {
            key,
            value,
            is_locked: false,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<CommitId> {
        // Phase 1: lock phase

        // The stability of the sort doesn't matter because the keys are unique.
        self.write_set.sort_unstable_by_key(|item| item.key);

        let mut tid_set = self.tid_generator.begin_transaction();
        for item in &mut self.write_set {
            let tid = self.records[item.key].lock();
            item.is_locked = true;
            tid_set.add(tid);
        }

        // Phase 2: validation phase
        for item in &self.read_set {
            let tid = Tid(self.records[item.key].tid.load(SeqCst));
            if tid != item.tid {
                // The TID doesn't match or the record is latched by
                // another transaction.
                return Err(Error::Conflict);
            }
            tid_set.add(tid);
        }

        let new_tid = tid_set.generate_tid();
        self.last_tid.store(new_tid.0, SeqCst);

        // Phase 3: write phase
        for item in self.write_set.drain(..) {
            let record = &self.records[item.key];
            record.value.store(item.value, SeqCst);

            // Store new TID and unlock the record.
            record.tid.store(new_tid.0, SeqCst);
        }

        Ok(CommitId(new_tid.0))
    }

    fn abort(&mut self) {
        for item in self.write_set.drain(..) {
            if item.is_locked {
                self.records[item.key].unlock();
            }
        }
        self.read_set.clear();
    }
}

struct ReadItem {
    key: Key,
    value: Value,
    tid: Tid,
}

struct WriteItem {
    key: Key,
    value: Value,
    is_locked: bool,
}
