// TID format:
// bits[63:16] - sequence
// bits[15:1]  - worker (distinguishes transactions with the same sequence)
// bit [0]     - latch

const WORKER_SHIFT: u32 = 1;
const SEQUENCE_SHIFT: u32 = 16;
const LATCH: u64 = 0x1;

/// The maximum number of workers that can generate TIDs at the same time.
pub const MAX_WORKERS: usize = 1 << (SEQUENCE_SHIFT - WORKER_SHIFT);

/// Transaction ID and latch bit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub u64);

impl Tid {
    pub const ZERO: Self = Self(0);

    pub const fn sequence(self) -> u64 {
        self.0 >> SEQUENCE_SHIFT
    }

    pub const fn worker(self) -> usize {
        ((self.0 >> WORKER_SHIFT) as usize) & (MAX_WORKERS - 1)
    }

    pub const fn is_locked(self) -> bool {
        self.0 & LATCH != 0
    }

    pub const fn with_locked(self) -> Self {
        Self(self.0 | LATCH)
    }

    pub const fn without_locked(self) -> Self {
        Self(self.0 & !LATCH)
    }

    const fn from_sequence_and_worker(sequence: u64, worker: usize) -> Self {
        Self((sequence << SEQUENCE_SHIFT) | ((worker as u64) << WORKER_SHIFT))
    }
}

impl std::fmt::Debug for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tid")
            .field("raw", &self.0)
            .field("sequence", &self.sequence())
            .field("worker", &self.worker())
            .field("locked", &self.is_locked())
            .finish()
    }
}

// The sequence of a TID should be the smallest number that is
// (a) larger than the sequence of any record read or written by
//     the transaction, and
// (b) larger than the worker’s most recently chosen sequence.

/// A generator of Silo-style TIDs.
pub struct TidGenerator {
    worker: usize,
    last_tid: Tid,
}

impl TidGenerator {
    /// Creates a generator for the `worker`-th worker, continuing from
    /// the last TID the worker generated.
    pub fn new(worker: usize, last_tid: Tid) -> Self {
        assert!(worker < MAX_WORKERS, "too many workers");
        Self { worker, last_tid }
    }

    pub const fn last_tid(&self) -> Tid {
        self.last_tid
    }

    pub fn begin_transaction(&mut self) -> TidSet {
        // (b) larger than the worker’s most recently chosen sequence
        let max_sequence = self.last_tid.sequence();
        TidSet {
            generator: self,
            max_sequence,
        }
    }
}

/// A set of TIDs read or written by a transaction.
pub struct TidSet<'a> {
    generator: &'a mut TidGenerator,
    max_sequence: u64,
}

impl TidSet<'_> {
    /// Adds a TID read or written by the transaction.
    pub fn add(&mut self, tid: Tid) {
        // (a) larger than the sequence of any record read or written by
        //     the transaction
        self.max_sequence = self.max_sequence.max(tid.sequence());
    }

    /// Generates a commit TID for the transaction.
    pub fn generate_tid(self) -> Tid {
        let sequence = self.max_sequence + 1;
        assert!(
            sequence < 1 << (u64::BITS - SEQUENCE_SHIFT),
            "TID sequence overflow"
        );
        let new_tid = Tid::from_sequence_and_worker(sequence, self.generator.worker);
        assert!(!new_tid.is_locked());
        self.generator.last_tid = new_tid;
        new_tid
    }
}

#[cfg(test)]
mod tests {
    use super::{Tid, TidGenerator};

    #[test]
    fn test_tid() {
        let tid = Tid::from_sequence_and_worker(42, 35);
        assert_eq!(tid.sequence(), 42);
        assert_eq!(tid.worker(), 35);
        assert!(!tid.is_locked());

        let locked = tid.with_locked();
        assert!(locked.is_locked());
        assert_eq!(locked.sequence(), 42);
        assert_eq!(locked.worker(), 35);
        assert_eq!(locked.without_locked(), tid);
    }

    #[test]
    fn generate() {
        let mut generator = TidGenerator::new(3, Tid::ZERO);

        let mut tid_set = generator.begin_transaction();
        tid_set.add(Tid::from_sequence_and_worker(7, 1).with_locked());
        tid_set.add(Tid::from_sequence_and_worker(5, 9));
        let tid = tid_set.generate_tid();
        assert_eq!(tid.sequence(), 8);
        assert_eq!(tid.worker(), 3);

        // Must be larger than the previous TID even if the records touched
        // have older TIDs.
        let mut tid_set = generator.begin_transaction();
        tid_set.add(Tid::from_sequence_and_worker(1, 0));
        let next = tid_set.generate_tid();
        assert_eq!(next.sequence(), 9);
        assert!(next > tid);
        assert_eq!(generator.last_tid(), next);
    }

    #[test]
    fn unique_across_workers() {
        let mut a = TidGenerator::new(1, Tid::ZERO);
        let mut b = TidGenerator::new(2, Tid::ZERO);
        let tid_a = a.begin_transaction().generate_tid();
        let tid_b = b.begin_transaction().generate_tid();
        assert_eq!(tid_a.sequence(), tid_b.sequence());
        assert_ne!(tid_a, tid_b);
    }
}
