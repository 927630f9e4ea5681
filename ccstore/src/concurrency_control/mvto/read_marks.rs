use super::Timestamp;
use parking_lot::Mutex;
use std::{
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicU64, Ordering::SeqCst},
};

/// The highest timestamp of the transactions that read a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMark {
    pub version: Timestamp,
    pub max_reader: Timestamp,
}

/// A set of read marks of a record, at most one per version.
///
/// `observe` is called under the shared lock of the record, so
/// implementations must tolerate concurrent `observe`s. The other mutating
/// method takes `&mut self` and is called under the exclusive lock.
pub trait ReadMarks: Default + Send + Sync + 'static {
    /// Records that a transaction with timestamp `reader` read `version`.
    fn observe(&self, version: Timestamp, reader: Timestamp);

    /// Returns `true` if some transaction with a timestamp greater than
    /// `writer` read a version older than `writer`.
    fn conflicts_with(&self, writer: Timestamp) -> bool;

    /// Discards the marks that can no longer cause a conflict because every
    /// future writer has a timestamp of at least `low_water_mark`.
    fn discard_before(&mut self, low_water_mark: Timestamp);

    /// Returns the marks in descending order of version.
    fn to_vec(&self) -> Vec<ReadMark>;
}

/// Read marks in a sorted array guarded by a mutex.
#[derive(Default)]
pub struct LockedReadMarks(Mutex<Vec<ReadMark>>);

impl ReadMarks for LockedReadMarks {
    fn observe(&self, version: Timestamp, reader: Timestamp) {
        let mut marks = self.0.lock();
        // Sorted in descending order of version.
        match marks.binary_search_by(|mark| version.cmp(&mark.version)) {
            Ok(i) => {
                let mark = &mut marks[i];
                mark.max_reader = mark.max_reader.max(reader);
            }
            Err(i) => marks.insert(
                i,
                ReadMark {
                    version,
                    max_reader: reader,
                },
            ),
        }
    }

    fn conflicts_with(&self, writer: Timestamp) -> bool {
        self.0
            .lock()
            .iter()
            .any(|mark| mark.version < writer && writer < mark.max_reader)
    }

    fn discard_before(&mut self, low_water_mark: Timestamp) {
        self.0
            .get_mut()
            .retain(|mark| mark.max_reader >= low_water_mark);
    }

    fn to_vec(&self) -> Vec<ReadMark> {
        self.0.lock().clone()
    }
}

/// Read marks in a singly linked list sorted in descending order of
/// version, into which nodes are inserted with compare-and-swap.
///
/// Nodes are unlinked and freed only through `&mut self`, so no traversal
/// can be in progress while a node is reclaimed.
#[derive(Default)]
pub struct LockFreeReadMarks {
    head: AtomicPtr<Node>,
}

struct Node {
    version: Timestamp,
    max_reader: AtomicU64,
    next: AtomicPtr<Node>,
}

impl LockFreeReadMarks {
    fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head.load(SeqCst),
            _marker: std::marker::PhantomData,
        }
    }
}

impl ReadMarks for LockFreeReadMarks {
    fn observe(&self, version: Timestamp, reader: Timestamp) {
        // Allocated at most once, and reused across failed CASes.
        let mut new_node: Option<Box<Node>> = None;

        let mut link = &self.head;
        let mut current = link.load(SeqCst);
        loop {
            // SAFETY: nodes are only freed through `&mut self`.
            match unsafe { current.as_ref() } {
                Some(node) if node.version > version => {
                    link = &node.next;
                    current = link.load(SeqCst);
                }
                Some(node) if node.version == version => {
                    node.max_reader.fetch_max(reader, SeqCst);
                    return;
                }
                _ => {
                    let mut node = new_node.take().unwrap_or_else(|| {
                        Box::new(Node {
                            version,
                            max_reader: AtomicU64::new(reader),
                            next: AtomicPtr::default(),
                        })
                    });
                    *node.next.get_mut() = current;
                    let ptr = Box::into_raw(node);
                    match link.compare_exchange(current, ptr, SeqCst, SeqCst) {
                        // The list owns the node from here on.
                        Ok(_) => return,
                        Err(actual) => {
                            // SAFETY: the node was never published.
                            new_node = Some(unsafe { Box::from_raw(ptr) });
                            // Another node was linked after `link`.
                            // Continue from it, as it may have the same
                            // version.
                            current = actual;
                        }
                    }
                }
            }
        }
    }

    fn conflicts_with(&self, writer: Timestamp) -> bool {
        self.iter()
            .skip_while(|node| node.version >= writer)
            .any(|node| writer < node.max_reader.load(SeqCst))
    }

    fn discard_before(&mut self, low_water_mark: Timestamp) {
        let mut link = self.head.get_mut();
        while let Some(ptr) = NonNull::new(*link) {
            // SAFETY: `&mut self` guarantees no one else is traversing.
            let node = unsafe { &mut *ptr.as_ptr() };
            if *node.max_reader.get_mut() < low_water_mark {
                *link = *node.next.get_mut();
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            } else {
                link = node.next.get_mut();
            }
        }
    }

    fn to_vec(&self) -> Vec<ReadMark> {
        self.iter()
            .map(|node| ReadMark {
                version: node.version,
                max_reader: node.max_reader.load(SeqCst),
            })
            .collect()
    }
}

impl Drop for LockFreeReadMarks {
    fn drop(&mut self) {
        self.discard_before(Timestamp::MAX);
    }
}

struct Iter<'a> {
    current: *mut Node,
    _marker: std::marker::PhantomData<&'a LockFreeReadMarks>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: nodes outlive the shared borrow of the list.
        let node = unsafe { self.current.as_ref() }?;
        self.current = node.next.load(SeqCst);
        Some(node)
    }
}
