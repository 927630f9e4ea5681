use super::Timestamp;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering::SeqCst},
};

/// Tracks the timestamps of in-flight transactions and decides when
/// obsolete versions should be collected.
pub struct Watermark {
    active: Mutex<ActiveTimestamps>,
    gc_threshold: u64,
    gc_count: AtomicU64,
}

struct ActiveTimestamps {
    next: Timestamp,

    // Timestamps are pushed in increasing order, so the front is the
    // low-water mark.
    queue: VecDeque<Timestamp>,
}

impl Watermark {
    pub fn new(gc_threshold: u64) -> Self {
        Self {
            active: Mutex::new(ActiveTimestamps {
                // Timestamp 0 is reserved for the initial versions.
                next: 1,
                queue: VecDeque::new(),
            }),
            gc_threshold,
            gc_count: AtomicU64::new(0),
        }
    }

    /// Assigns a fresh timestamp to a beginning transaction.
    pub fn begin(&self) -> Timestamp {
        let mut active = self.active.lock();
        let ts = active.next;
        active.next += 1;
        active.queue.push_back(ts);
        ts
    }

    /// Removes the timestamp of a finished transaction.
    ///
    /// Returns the new low-water mark if versions older than it should be
    /// garbage collected.
    pub fn finish(&self, ts: Timestamp) -> Option<Timestamp> {
        let mut active = self.active.lock();
        if active.queue.front() != Some(&ts) {
            let i = active.queue.iter().position(|&t| t == ts);
            let i = i.expect("timestamp is not active");
            active.queue.remove(i);
            return None;
        }

        active.queue.pop_front();
        let low_water_mark = *active.queue.front()?;
        drop(active);

        if low_water_mark - ts <= self.gc_threshold {
            return None;
        }
        self.gc_count.fetch_add(1, SeqCst);
        tracing::debug!(
            old_low_water_mark = ts,
            new_low_water_mark = low_water_mark,
            "collecting obsolete versions"
        );
        Some(low_water_mark)
    }

    /// The smallest active timestamp.
    pub fn low_water_mark(&self) -> Option<Timestamp> {
        self.active.lock().queue.front().copied()
    }

    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(SeqCst)
    }
}
