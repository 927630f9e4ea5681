// Based on the design of thread_local crate
// https://github.com/Amanieu/thread_local-rs/blob/faa4409fafa3a5b4898c4e5025733f760a3eb665/src/lib.rs

use std::{
    cell::UnsafeCell,
    fmt::{Debug, Formatter},
    mem::MaybeUninit,
    ops::Deref,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering::SeqCst},
};

const NUM_BUCKETS: usize = (usize::BITS - 1) as usize;

/// A cell that can store multiple values in locations called slots.
///
/// Slots are identified by dense indices, and a released slot is handed out
/// again, together with the value it holds, by a later allocation.
pub struct SlottedCell<T> {
    buckets: [AtomicPtr<Entry<T>>; NUM_BUCKETS],
}

impl<T> SlottedCell<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let num_allocated_buckets = (usize::BITS - capacity.leading_zeros()) as usize;

        let mut buckets = [std::ptr::null_mut(); NUM_BUCKETS];
        for (i, bucket) in buckets[..num_allocated_buckets].iter_mut().enumerate() {
            *bucket = alloc_bucket::<T>(bucket_len(i));
        }

        Self {
            // SAFETY: AtomicPtr has the same representation as a pointer and
            //         arrays have the same representation as
            //         a sequence of their inner type.
            buckets: unsafe { std::mem::transmute(buckets) },
        }
    }

    /// Allocates the free slot with the smallest index, initializing it with
    /// `f` if the slot was never used before.
    pub fn alloc_with<F>(&self, f: F) -> Slot<T>
    where
        F: FnOnce(usize) -> T,
    {
        let mut index = 0;
        for (bucket_index, bucket) in self.buckets.iter().enumerate() {
            let bucket_len = bucket_len(bucket_index);
            let bucket_ptr = bucket.load(SeqCst);
            let entries = if bucket_ptr.is_null() {
                let new = alloc_bucket(bucket_len);
                let result = bucket.compare_exchange(std::ptr::null_mut(), new, SeqCst, SeqCst);
                match result {
                    Ok(_) => new,
                    Err(ptr) => {
                        unsafe { dealloc_bucket(new, bucket_len) };
                        ptr
                    }
                }
            } else {
                bucket_ptr
            };

            for entry_index in 0..bucket_len {
                let entry = unsafe { &*entries.add(entry_index) };
                let result = entry
                    .is_occupied
                    .compare_exchange(false, true, SeqCst, SeqCst);
                if result.is_err() {
                    index += 1;
                    continue;
                }
                entry.init_once(index, f);
                return Slot { entry, index };
            }
        }
        unreachable!("too many slots")
    }
}

impl<T> Default for SlottedCell<T> {
    fn default() -> Self {
        Self::with_capacity(2)
    }
}

impl<T> Drop for SlottedCell<T> {
    fn drop(&mut self) {
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            let ptr = *bucket.get_mut();
            if ptr.is_null() {
                continue;
            }
            let len = bucket_len(i);
            unsafe { dealloc_bucket(ptr, len) };
        }
    }
}

struct Entry<T> {
    is_occupied: AtomicBool,
    is_initialized: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for Entry<T> {
    fn default() -> Self {
        Self {
            is_occupied: Default::default(),
            is_initialized: Default::default(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<T> Drop for Entry<T> {
    fn drop(&mut self) {
        if *self.is_initialized.get_mut() {
            unsafe { (*self.value.get()).assume_init_drop() };
        }
    }
}

impl<T> Entry<T> {
    unsafe fn get_unchecked(&self) -> &T {
        (*self.value.get()).assume_init_ref()
    }

    /// Must be called only by the owner of `is_occupied`.
    fn init_once<F>(&self, index: usize, f: F)
    where
        F: FnOnce(usize) -> T,
    {
        if !self.is_initialized.load(SeqCst) {
            let value = f(index);
            let ptr = self.value.get();
            unsafe { &mut *ptr }.write(value);
            self.is_initialized.store(true, SeqCst);
        }
    }
}

fn alloc_bucket<T>(len: usize) -> *mut Entry<T> {
    let entries = (0..len).map(|_| Entry::<T>::default()).collect();
    Box::into_raw(entries).cast()
}

unsafe fn dealloc_bucket<T>(ptr: *mut Entry<T>, len: usize) {
    let _ = Box::from_raw(std::slice::from_raw_parts_mut(ptr, len));
}

const fn bucket_len(bucket_index: usize) -> usize {
    1 << bucket_index
}

/// A slot in a [`SlottedCell`].
///
/// Dropping a `Slot` will mark a slot as unoccupied and allow it to be
/// reused by a subsequent call to [`SlottedCell::alloc_with`].
/// However, the value will not be dropped and will remain in the slot until
/// the [`SlottedCell`] is dropped.
pub struct Slot<'a, T> {
    entry: &'a Entry<T>,
    index: usize,
}

unsafe impl<T: Sync> Send for Slot<'_, T> {}
unsafe impl<T: Sync> Sync for Slot<'_, T> {}

impl<T> Slot<'_, T> {
    /// The index of the slot, which is unique among the occupied slots of
    /// the same [`SlottedCell`].
    pub const fn index(&self) -> usize {
        self.index
    }

    fn value(&self) -> &T {
        // SAFETY: The Slot is crated only when the Entry is successfully
        //         occupied and initialized.
        unsafe { self.entry.get_unchecked() }
    }
}

impl<T> Drop for Slot<'_, T> {
    fn drop(&mut self) {
        let was_occupied = self.entry.is_occupied.swap(false, SeqCst);
        assert!(was_occupied);
    }
}

impl<T> Deref for Slot<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value()
    }
}

impl<T: Debug> Debug for Slot<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Slot")
            .field(&self.index)
            .field(&self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::SlottedCell;
    use std::{cell::Cell, rc::Rc};

    #[test]
    fn alloc_with() {
        let cell = SlottedCell::default();
        let slot1 = cell.alloc_with(|i| {
            assert_eq!(i, 0);
            Cell::new(1)
        });
        let slot2 = cell.alloc_with(|i| {
            assert_eq!(i, 1);
            Cell::new(2)
        });
        assert_eq!(slot1.index(), 0);
        assert_eq!(slot2.index(), 1);
        assert_ne!(slot1.as_ptr(), slot2.as_ptr());
        assert_eq!(slot1.get(), 1);
        assert_eq!(slot2.get(), 2);
    }

    #[test]
    fn reuse() {
        let cell = SlottedCell::<Cell<u32>>::default();
        let ptr = {
            let _slot0 = cell.alloc_with(|_| Cell::new(0));
            let slot1 = cell.alloc_with(|_| Cell::new(0));
            slot1.set(42);
            slot1.as_ptr()
        };
        let slot0 = cell.alloc_with(|_| unreachable!());
        let slot1 = cell.alloc_with(|_| unreachable!());
        assert_eq!(slot0.index(), 0);
        assert_eq!(slot1.index(), 1);
        assert_eq!(slot1.as_ptr(), ptr);
        assert_eq!(slot1.get(), 42);
    }

    #[test]
    fn many_slots() {
        let cell = SlottedCell::<usize>::with_capacity(1);
        let slots: Vec<_> = (0..100).map(|_| cell.alloc_with(|i| i)).collect();
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot.index(), i);
            assert_eq!(**slot, i);
        }
    }

    #[test]
    fn test_drop() {
        struct NeedsDrop(Rc<Cell<bool>>);

        impl Drop for NeedsDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let cell = SlottedCell::<NeedsDrop>::default();
        let dropped = Rc::new(Cell::new(false));
        let slot = cell.alloc_with(|_| NeedsDrop(dropped.clone()));
        drop(slot);
        assert!(!dropped.get());
        drop(cell);
        assert!(dropped.get());
    }
}
