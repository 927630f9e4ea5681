use std::{
    cmp::Ordering,
    fmt::{Debug, Formatter},
    ops::{BitOr, BitOrAssign},
};

/// Identifies a record. Keys of a store are `0..num_keys`.
pub type Key = usize;

/// The scalar stored in every record.
pub type Value = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
}

/// A single step of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation {
    pub key: Key,
    pub kind: OperationKind,
}

impl Operation {
    pub const fn read(key: Key) -> Self {
        Self {
            key,
            kind: OperationKind::Read,
        }
    }

    pub const fn write(key: Key) -> Self {
        Self {
            key,
            kind: OperationKind::Write,
        }
    }
}

// bit [0]: read
// bit [1]: write

const READ: u8 = 0x1;
const WRITE: u8 = 0x2;

/// The set of ways a transaction accesses a key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Access(u8);

impl Access {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(READ);
    pub const WRITE: Self = Self(WRITE);
    pub const READ_WRITE: Self = Self(READ | WRITE);

    pub const fn reads(self) -> bool {
        self.0 & READ != 0
    }

    pub const fn writes(self) -> bool {
        self.0 & WRITE != 0
    }

    /// Returns `true` if the key is read but never written.
    pub const fn is_read_only(self) -> bool {
        self.0 == READ
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<OperationKind> for Access {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Read => Self::READ,
            OperationKind::Write => Self::WRITE,
        }
    }
}

impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Debug for Access {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self.0 {
            0 => "-",
            READ => "r",
            WRITE => "w",
            _ => "rw",
        })
    }
}

/// Keys accessed by a transaction, together with how they are accessed.
///
/// Entries are kept sorted by key, which is the canonical order in which
/// locks are acquired.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    entries: Vec<(Key, Access)>,
}

impl AccessSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_operations(operations: &[Operation]) -> Self {
        operations.iter().copied().collect()
    }

    /// Adds `access` to the accesses of `key`.
    pub fn insert(&mut self, key: Key, access: Access) {
        match self.entries.binary_search_by_key(&key, |&(k, _)| k) {
            Ok(i) => self.entries[i].1 |= access,
            Err(i) => self.entries.insert(i, (key, access)),
        }
    }

    pub fn get(&self, key: Key) -> Access {
        self.entries
            .binary_search_by_key(&key, |&(k, _)| k)
            .map_or(Access::NONE, |i| self.entries[i].1)
    }

    /// Iterates over the entries in ascending order of keys.
    pub fn iter(&self) -> impl Iterator<Item = (Key, Access)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns `true` if a key read by `self` is written by `other`.
    pub fn reads_any_written_by(&self, other: &Self) -> bool {
        self.intersects(other, |mine, theirs| mine.reads() && theirs.writes())
    }

    /// Returns `true` if a key written by `other` is read or written by
    /// `self`.
    pub fn touches_any_written_by(&self, other: &Self) -> bool {
        self.intersects(other, |_, theirs| theirs.writes())
    }

    fn intersects<F>(&self, other: &Self, conflicts: F) -> bool
    where
        F: Fn(Access, Access) -> bool,
    {
        let (mut i, mut j) = (0, 0);
        while i < self.entries.len() && j < other.entries.len() {
            let (a, access_a) = self.entries[i];
            let (b, access_b) = other.entries[j];
            match a.cmp(&b) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    if conflicts(access_a, access_b) {
                        return true;
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        false
    }
}

impl FromIterator<Operation> for AccessSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        let mut set = Self::new();
        for op in iter {
            set.insert(op.key, op.kind.into());
        }
        set
    }
}

impl Debug for AccessSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, AccessSet, Operation};

    #[test]
    fn merge_accesses() {
        let set = AccessSet::from_operations(&[
            Operation::write(3),
            Operation::read(1),
            Operation::read(3),
            Operation::read(1),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1), Access::READ);
        assert_eq!(set.get(3), Access::READ_WRITE);
        assert_eq!(set.get(2), Access::NONE);
        assert!(set.get(1).is_read_only());
        assert!(!set.get(3).is_read_only());
        assert!(set.get(2).is_empty());
        assert_eq!(
            set.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn intersections() {
        let reader = AccessSet::from_operations(&[Operation::read(1), Operation::write(4)]);
        let writer = AccessSet::from_operations(&[Operation::write(1)]);
        let other_writer = AccessSet::from_operations(&[Operation::write(4), Operation::read(1)]);

        assert!(reader.reads_any_written_by(&writer));
        assert!(!writer.reads_any_written_by(&reader));
        assert!(!reader.reads_any_written_by(&other_writer));
        assert!(reader.touches_any_written_by(&other_writer));
        assert!(!AccessSet::new().touches_any_written_by(&writer));
    }

    #[test]
    fn debug() {
        let set = AccessSet::from_operations(&[Operation::read(0), Operation::write(0)]);
        assert_eq!(format!("{set:?}"), "{0: rw}");
    }
}
