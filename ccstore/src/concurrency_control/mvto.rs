mod read_marks;
mod watermark;

use super::{
    record, CommitId, ConcurrencyControl, ConcurrencyControlInternal, TransactionExecutor,
};
use crate::{AccessSet, Error, Key, Result, StoreOptions, Value};
use crossbeam_utils::Backoff;
use parking_lot::RwLock;
use read_marks::{LockFreeReadMarks, LockedReadMarks, ReadMarks};
use std::{collections::BTreeMap, fmt, marker::PhantomData};
use watermark::Watermark;

pub type Timestamp = u64;

/// Multi-version timestamp ordering.
///
/// Every transaction is assigned a timestamp at its beginning, and reads
/// the newest version older than or equal to the timestamp. A write is
/// rejected if a transaction with a newer timestamp has already read
/// a version older than the write.
pub struct MultiVersion<M> {
    watermark: Watermark,
    _marker: PhantomData<fn() -> M>,
}

/// MVTO whose read marks are guarded by a mutex.
pub type Mvto = MultiVersion<LockedReadMarks>;

/// MVTO whose read marks are inserted into a lock-free list.
pub type LockFreeMvto = MultiVersion<LockFreeReadMarks>;

impl<M: ReadMarks> ConcurrencyControl for MultiVersion<M> {}

impl<M: ReadMarks> ConcurrencyControlInternal for MultiVersion<M> {
    type Record = Record<M>;
    type Executor<'a> = Executor<'a, M>;

    fn init(options: &StoreOptions) -> Self {
        Self {
            watermark: Watermark::new(options.gc_threshold),
            _marker: PhantomData,
        }
    }

    fn executor<'a>(&'a self, records: &'a [Self::Record]) -> Self::Executor<'a> {
        Self::Executor {
            records,
            watermark: &self.watermark,
            timestamp: 0,
            write_set: Vec::new(),
        }
    }

    fn committed_value(record: &Self::Record) -> Value {
        let chain = record.chain.read();
        chain
            .versions
            .values()
            .rev()
            .find(|version| version.is_committed)
            .map_or(0, |version| version.value)
    }

    fn fmt_record(record: &Self::Record, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain = record.chain.read();
        f.write_str("versions=[")?;
        for (i, (ts, version)) in chain.versions.iter().rev().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ts}:{}", version.value)?;
            if !version.is_committed {
                f.write_str("(pending)")?;
            }
        }
        f.write_str("] read_marks=[")?;
        for (i, mark) in chain.read_marks.to_vec().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}<-{}", mark.version, mark.max_reader)?;
        }
        f.write_str("]")
    }

    fn gc_count(&self) -> u64 {
        self.watermark.gc_count()
    }
}

pub struct Record<M> {
    chain: RwLock<VersionChain<M>>,
}

struct VersionChain<M> {
    versions: BTreeMap<Timestamp, Version>,
    read_marks: M,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Version {
    value: Value,
    is_committed: bool,
}

impl<M: ReadMarks> Default for Record<M> {
    fn default() -> Self {
        let initial = Version {
            value: 0,
            is_committed: true,
        };
        Self {
            chain: RwLock::new(VersionChain {
                versions: [(0, initial)].into(),
                read_marks: M::default(),
            }),
        }
    }
}

impl<M: ReadMarks> Record<M> {
    /// Reads the newest version older than or equal to `ts`.
    ///
    /// Waits if the version was written by another in-flight transaction.
    fn read(&self, ts: Timestamp) -> Value {
        let backoff = Backoff::new();
        loop {
            let chain = self.chain.read();
            let (&version, entry) = chain
                .versions
                .range(..=ts)
                .next_back()
                .expect("initial version should never be collected");

            if !entry.is_committed && version != ts {
                // Writers have smaller timestamps than the readers
                // waiting for them, so waits can't form a cycle.
                drop(chain);
                backoff.snooze();
                continue;
            }

            // A writer with a timestamp in (version, ts) would have been
            // visible to this read.
            if ts > version + 1 {
                chain.read_marks.observe(version, ts);
            }
            return entry.value;
        }
    }

    /// Installs an uncommitted version with timestamp `ts`.
    fn write(&self, ts: Timestamp, value: Value) -> Result<()> {
        let mut chain = self.chain.write();
        if chain.read_marks.conflicts_with(ts) {
            return Err(Error::Conflict);
        }
        chain.versions.insert(
            ts,
            Version {
                value,
                is_committed: false,
            },
        );
        Ok(())
    }

    fn commit(&self, ts: Timestamp) {
        let mut chain = self.chain.write();
        let version = chain.versions.get_mut(&ts).expect("version not found");
        assert!(!version.is_committed);
        version.is_committed = true;
    }

    fn rollback(&self, ts: Timestamp) {
        let removed = self.chain.write().versions.remove(&ts);
        assert!(removed.is_some_and(|version| !version.is_committed));
    }

    /// Removes the versions and read marks that no transaction with
    /// a timestamp of at least `low_water_mark` can observe.
    ///
    /// The newest version older than `low_water_mark` is kept, as it is
    /// what those transactions read until a newer version is written.
    fn collect_garbage(&self, low_water_mark: Timestamp) {
        let mut chain = self.chain.write();
        let chain = &mut *chain;
        let floor = chain
            .versions
            .range(..low_water_mark)
            .next_back()
            .map_or(0, |(&ts, _)| ts);
        chain.versions.retain(|&ts, _| ts == 0 || ts >= floor);
        chain.read_marks.discard_before(low_water_mark);
    }
}

pub struct Executor<'a, M> {
    // Global state
    records: &'a [Record<M>],
    watermark: &'a Watermark,

    // Per-transaction state
    timestamp: Timestamp,
    write_set: Vec<Key>,
}

impl<M: ReadMarks> TransactionExecutor for Executor<'_, M> {
    fn begin_transaction(&mut self, _: &AccessSet) -> Result<()> {
        self.timestamp = self.watermark.begin();
        self.write_set.clear();
        Ok(())
    }

    fn end_transaction(&mut self) {
        if let Some(low_water_mark) = self.watermark.finish(self.timestamp) {
            for record in self.records {
                record.collect_garbage(low_water_mark);
            }
        }
    }

    fn read(&mut self, key: Key) -> Result<Value> {
        Ok(record(self.records, key)?.read(self.timestamp))
    }

    fn write(&mut self, key: Key, value: Value) -> Result<()> {
        record(self.records, key)?.write(self.timestamp, value)?;
        if !self.write_set.contains(&key) {
            self.write_set.push(key);
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<CommitId> {
        for key in self.write_set.drain(..) {
            self.records[key].commit(self.timestamp);
        }
        Ok(CommitId(self.timestamp))
    }

    fn abort(&mut self) {
        for key in self.write_set.drain(..) {
            self.records[key].rollback(self.timestamp);
        }
    }
}
