//! Probabilistic scan index over free records.
//!
//! An ordered map from `(file, offset)` to a record handle. Only a random
//! subset of free records is ever inserted, which keeps the index sublinear in
//! the number of records; lookups therefore return a *hint*, the nearest
//! indexed record at or below a key, and callers finish with a linear scan
//! of the sorted free list.

use std::collections::BTreeMap;

use crate::core::record::Handle;

#[derive(Default)]
pub(crate) struct ScanIndex {
    entries: BTreeMap<(u32, u64), Handle>,
}

impl ScanIndex {
    pub fn new() -> Self {
        ScanIndex {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: (u32, u64), handle: Handle) {
        self.entries.insert(key, handle);
    }

    /// Remove the entry for `key`, returning its handle if it was present.
    pub fn remove(&mut self, key: (u32, u64)) -> Option<Handle> {
        self.entries.remove(&key)
    }

    /// Nearest indexed record with key at or below `key`.
    pub fn nearest_at_or_below(&self, key: (u32, u64)) -> Option<Handle> {
        self.entries.range(..=key).next_back().map(|(_, &h)| h)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// All `(key, handle)` pairs in order. Used by the invariant walker.
    pub fn iter(&self) -> impl Iterator<Item = ((u32, u64), Handle)> + '_ {
        self.entries.iter().map(|(&k, &h)| (k, h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{FreeRecord, RecordArena};

    fn handle(arena: &mut RecordArena, file: u32, offset: u64) -> Handle {
        arena.alloc(FreeRecord::new(file, offset, 1)).unwrap()
    }

    #[test]
    fn test_nearest_at_or_below() {
        let mut arena = RecordArena::new(None);
        let mut index = ScanIndex::new();

        let a = handle(&mut arena, 0, 10);
        let b = handle(&mut arena, 0, 50);
        let c = handle(&mut arena, 1, 0);
        index.insert((0, 10), a);
        index.insert((0, 50), b);
        index.insert((1, 0), c);

        assert_eq!(index.nearest_at_or_below((0, 9)), None);
        assert_eq!(index.nearest_at_or_below((0, 10)), Some(a));
        assert_eq!(index.nearest_at_or_below((0, 49)), Some(a));
        assert_eq!(index.nearest_at_or_below((0, 1000)), Some(b));
        assert_eq!(index.nearest_at_or_below((1, 5)), Some(c));
        assert_eq!(index.nearest_at_or_below((7, 0)), Some(c));
    }

    #[test]
    fn test_remove_reports_presence() {
        let mut arena = RecordArena::new(None);
        let mut index = ScanIndex::new();

        let a = handle(&mut arena, 3, 128);
        index.insert((3, 128), a);

        assert_eq!(index.remove((3, 128)), Some(a));
        assert_eq!(index.remove((3, 128)), None);
        assert_eq!(index.len(), 0);
    }
}
