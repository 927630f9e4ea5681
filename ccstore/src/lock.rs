use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

// bit [0]:     Whether exclusive lock is held
// bits[1..63]: Number of shared locks held

const WRITER_SHIFT: u64 = 0;
const READER_SHIFT: u64 = 1;

const WRITER: u64 = 1 << WRITER_SHIFT;
const READER: u64 = 1 << READER_SHIFT;

const READER_FULL: u64 = !(READER - 1);

/// A reader-writer lock that is held across calls of a transaction executor.
///
/// Waiting is done by spinning with exponential backoff, as the lock is
/// acquired in a canonical order and deadlocks can't occur.
pub struct Lock(AtomicU64);

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(SeqCst) != 0
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.0.load(SeqCst) & WRITER != 0
    }

    /// Acquire a read lock.
    ///
    /// This method will block until the lock is acquired.
    #[must_use]
    pub fn read(&self) -> ReadGuard {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_read() {
                return guard;
            }
            backoff.snooze();
        }
    }

    /// Acquire a write lock.
    ///
    /// This method will block until the lock is acquired.
    #[must_use]
    pub fn write(&self) -> WriteGuard {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_write() {
                return guard;
            }
            backoff.snooze();
        }
    }

    /// Try to acquire a read lock.
    ///
    /// If the lock can't be immediately acquired, this method will return
    /// `None`.
    #[must_use]
    pub fn try_read(&self) -> Option<ReadGuard> {
        // We shouldn't use then_some(ReadGuard(self)) here because
        // we don't want to drop() the guard if we fail to acquire the lock.
        self.try_lock_shared().then(|| ReadGuard(self))
    }

    /// Try to acquire a write lock.
    ///
    /// If the lock can't be immediately acquired, this method will return
    /// `None`.
    #[must_use]
    pub fn try_write(&self) -> Option<WriteGuard> {
        self.try_lock_exclusive().then(|| WriteGuard(self))
    }

    fn try_lock_shared(&self) -> bool {
        let current = self.0.load(SeqCst);
        if current & WRITER != 0 || current & READER_FULL == READER_FULL {
            return false;
        }
        self.0
            .compare_exchange(current, current + READER, SeqCst, SeqCst)
            .is_ok()
    }

    fn try_lock_exclusive(&self) -> bool {
        self.0
            .compare_exchange(0, WRITER, SeqCst, SeqCst)
            .is_ok()
    }

    fn unlock_shared(&self) {
        let prev = self.0.fetch_sub(READER, SeqCst);
        assert_eq!(prev & WRITER, 0, "lock is write-locked");
        assert!(prev >= READER, "lock is not read-locked");
    }

    fn unlock_exclusive(&self) {
        let prev = self.0.swap(0, SeqCst);
        assert_eq!(prev, WRITER, "lock is not write-locked");
    }
}

pub struct ReadGuard<'a>(&'a Lock);

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock_shared();
    }
}

pub struct WriteGuard<'a>(&'a Lock);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.unlock_exclusive();
    }
}
