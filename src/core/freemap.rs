//! Free-space map over a growable collection of numbered storage files.
//!
//! All free space is kept on one large sorted linked list, with a partial
//! scan index keyed on location to allow quick freeing and reallocation with
//! merging of contiguous entries. A separate set of linked lists groups free
//! entries by power-of-two size range, which lets a request be matched to a
//! large-enough entry in near-constant time. Each growable file also carries
//! at most one "unused" record: the never-carved tail that new space is drawn
//! from before the growth provider is consulted.

use std::fmt;
use std::io;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::index::ScanIndex;
use crate::core::record::{size_class, FreeRecord, Handle, RecordArena, SIZE_CLASSES};
use crate::error::FreeMapError;

/// Default share of records that enter the scan index.
pub(crate) const DEFAULT_INDEX_FRACTION: f64 = 0.2;

/// Candidate-selection strategy for plain allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// First large-enough record in (file, offset) order.
    First,
    /// First large-enough record found walking size buckets upward.
    Close,
    /// Smallest large-enough record.
    Best,
    /// Largest large-enough record.
    Worst,
}

/// A granted range. `size` is the actual grant, which may exceed the request
/// by up to the append budget unless the request was exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub file: u32,
    pub offset: u64,
    pub size: u32,
}

/// One free or unused range, as reported by the introspection iterators.
///
/// Serializable so callers can snapshot the map's layout and replay it into a
/// fresh instance after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub file: u32,
    pub offset: u64,
    pub size: u32,
}

/// Options for [`FreeMap::allocate_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocOptions {
    /// Forbid rounding the grant up by the append budget.
    pub exact: bool,
    /// Require the grant to start exactly at this (file, offset).
    pub at: Option<(u32, u64)>,
}

impl AllocOptions {
    pub fn exact() -> Self {
        AllocOptions {
            exact: true,
            at: None,
        }
    }

    pub fn at(file: u32, offset: u64) -> Self {
        AllocOptions {
            exact: false,
            at: Some((file, offset)),
        }
    }

    pub fn exact_at(file: u32, offset: u64) -> Self {
        AllocOptions {
            exact: true,
            at: Some((file, offset)),
        }
    }
}

/// Supplies the capacity of newly appended files.
///
/// Called with monotonically increasing file indices starting from 0. The
/// provider must not call back into the map that invoked it.
pub trait FileProvider {
    /// Maximum usable size of file `file`, or `None` to decline growth.
    fn new_file(&mut self, file: u32) -> Option<u32>;
}

impl<F> FileProvider for F
where
    F: FnMut(u32) -> Option<u32>,
{
    fn new_file(&mut self, file: u32) -> Option<u32> {
        self(file)
    }
}

/// Free-space map for contiguous byte ranges in numbered storage files.
///
/// Tracks free and unused space only; the map performs no I/O and never sees
/// the bytes themselves. See the crate-level docs for the data model.
pub struct FreeMap {
    arena: RecordArena,
    index: ScanIndex,
    size_heads: [Option<Handle>; SIZE_CLASSES],
    size_tails: [Option<Handle>; SIZE_CLASSES],
    /// Head of the sorted free list.
    first: Option<Handle>,
    /// Head of the unused-tail list, sorted by file.
    unused: Option<Handle>,
    entries: u32,
    last_error: Option<FreeMapError>,
    /// Total bytes ever granted by the provider.
    space: u64,
    wasted: u64,
    append: u32,
    files: u32,
    strategy: Strategy,
    /// RNG threshold for indexing a new record.
    index_mark: u32,
    rng: Box<dyn RngCore>,
    provider: Box<dyn FileProvider>,
}

impl FreeMap {
    /// Create a map with the default index fraction and RNG.
    ///
    /// Use [`FreeMap::builder`] to override the index fraction, inject a
    /// deterministic RNG, or cap the record arena.
    pub fn new<P>(strategy: Strategy, append: u32, provider: P) -> Self
    where
        P: FileProvider + 'static,
    {
        Self::with_parts(
            strategy,
            append,
            DEFAULT_INDEX_FRACTION,
            None,
            Box::new(SmallRng::from_entropy()),
            Box::new(provider),
        )
    }

    pub(crate) fn with_parts(
        strategy: Strategy,
        append: u32,
        index_fraction: f64,
        record_limit: Option<usize>,
        rng: Box<dyn RngCore>,
        provider: Box<dyn FileProvider>,
    ) -> Self {
        let map = FreeMap {
            arena: RecordArena::new(record_limit),
            index: ScanIndex::new(),
            size_heads: [None; SIZE_CLASSES],
            size_tails: [None; SIZE_CLASSES],
            first: None,
            unused: None,
            entries: 0,
            last_error: None,
            space: 0,
            wasted: 0,
            append,
            files: 0,
            strategy,
            index_mark: (index_fraction * u32::MAX as f64) as u32,
            rng,
            provider,
        };
        map.verify();
        map
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes anywhere, possibly rounding the grant up by the
    /// append budget to avoid leaving a tiny fragment behind.
    pub fn allocate(&mut self, size: u32) -> Option<Allocation> {
        self.allocate_with(size, AllocOptions::default())
    }

    /// Allocate exactly `size` bytes anywhere.
    pub fn allocate_exact(&mut self, size: u32) -> Option<Allocation> {
        self.allocate_with(size, AllocOptions::exact())
    }

    /// Allocate `size` bytes according to `options`.
    ///
    /// A zero-size request trivially succeeds with an empty grant and no side
    /// effects. `None` means the request could not be satisfied; that is an
    /// error only if [`FreeMap::last_error`] reports one; running out of
    /// space with the provider declining growth is a normal outcome.
    pub fn allocate_with(&mut self, size: u32, options: AllocOptions) -> Option<Allocation> {
        if let Some((file, offset)) = options.at {
            let out = self.allocate_at(file, offset, size, options.exact);
            self.verify();
            return out;
        }

        if size == 0 {
            return Some(Allocation {
                file: 0,
                offset: 0,
                size: 0,
            });
        }

        debug!(size, exact = options.exact, strategy = ?self.strategy, "allocate");

        let out = if let Some(rec) = self.pick_candidate(size) {
            debug_assert!(self.arena[rec].size >= size);
            self.take_from_free(rec, size, options.exact)
        } else {
            // No free record fits; fall back to unused tails, first fit.
            let mut tail = None;
            let mut fit = None;
            let mut cur = self.unused;
            while let Some(h) = cur {
                tail = Some(h);
                if self.arena[h].size >= size {
                    fit = Some(h);
                    break;
                }
                cur = self.arena[h].next;
            }
            match fit {
                Some(h) => self.take_from_unused_front(h, size, options.exact),
                None => self.grow_for(size, options.exact, tail),
            }
        };

        self.verify();
        out
    }

    /// Pick a candidate free record for `size` per the configured strategy.
    fn pick_candidate(&self, size: u32) -> Option<Handle> {
        match self.strategy {
            Strategy::First => {
                let mut cur = self.first;
                while let Some(h) = cur {
                    if self.arena[h].size >= size {
                        return Some(h);
                    }
                    cur = self.arena[h].next;
                }
                None
            }
            Strategy::Close => {
                for class in size_class(size)..SIZE_CLASSES {
                    let mut cur = self.size_heads[class];
                    while let Some(h) = cur {
                        if self.arena[h].size >= size {
                            return Some(h);
                        }
                        cur = self.arena[h].next_size;
                    }
                }
                None
            }
            Strategy::Best => {
                // The lowest bucket with any qualifier holds the global best.
                for class in size_class(size)..SIZE_CLASSES {
                    let mut best: Option<Handle> = None;
                    let mut cur = self.size_heads[class];
                    while let Some(h) = cur {
                        let s = self.arena[h].size;
                        if s >= size && best.map_or(true, |b| s < self.arena[b].size) {
                            best = Some(h);
                        }
                        cur = self.arena[h].next_size;
                    }
                    if best.is_some() {
                        return best;
                    }
                }
                None
            }
            Strategy::Worst => {
                // The highest bucket with any qualifier holds the global worst.
                for class in (size_class(size)..SIZE_CLASSES).rev() {
                    let mut worst: Option<Handle> = None;
                    let mut cur = self.size_heads[class];
                    while let Some(h) = cur {
                        let s = self.arena[h].size;
                        if s >= size && worst.map_or(true, |w| s > self.arena[w].size) {
                            worst = Some(h);
                        }
                        cur = self.arena[h].next_size;
                    }
                    if worst.is_some() {
                        return worst;
                    }
                }
                None
            }
        }
    }

    /// Grant from the front of a free-list record.
    fn take_from_free(&mut self, h: Handle, size: u32, exact: bool) -> Option<Allocation> {
        let (file, offset, rec_size) = {
            let r = &self.arena[h];
            (r.file, r.offset, r.size)
        };

        if rec_size == size || (!exact && self.within_append(rec_size, size)) {
            self.release_free_record(h).ok()?;
            return Some(Allocation {
                file,
                offset,
                size: rec_size,
            });
        }

        let old_key = (file, offset);
        {
            let r = &mut self.arena[h];
            r.offset += size as u64;
            r.size -= size;
        }
        self.size_relink(h, rec_size);
        self.index_reposition(h, old_key);
        Some(Allocation { file, offset, size })
    }

    /// Grant from the front of an unused-tail record.
    fn take_from_unused_front(&mut self, h: Handle, size: u32, exact: bool) -> Option<Allocation> {
        let (file, offset, rec_size) = {
            let r = &self.arena[h];
            (r.file, r.offset, r.size)
        };

        if rec_size == size || (!exact && self.within_append(rec_size, size)) {
            self.release_unused_record(h);
            return Some(Allocation {
                file,
                offset,
                size: rec_size,
            });
        }

        let r = &mut self.arena[h];
        r.offset += size as u64;
        r.size -= size;
        Some(Allocation { file, offset, size })
    }

    /// Ask the provider for a new file and grant from it. `tail` is the last
    /// record of the unused list; a remainder is appended after it so space in
    /// earlier files gets used in preference to space in later files.
    fn grow_for(&mut self, size: u32, exact: bool, tail: Option<Handle>) -> Option<Allocation> {
        let rec = match self.arena.alloc(FreeRecord::new(self.files, 0, 0)) {
            Some(h) => h,
            None => {
                self.record_error(FreeMapError::PoolExhausted(self.arena.live()));
                return None;
            }
        };
        let space = match self.provider.new_file(self.files) {
            Some(space) => space,
            None => {
                // Growth declined: a normal failed allocation, not an error.
                self.arena.free(rec);
                return None;
            }
        };

        let file = self.files;
        info!(file, space, "provider appended file");
        self.space += space as u64;
        self.files += 1;

        if space == size || (!exact && space >= size && self.within_append(space, size)) {
            // The whole file goes to this grant.
            self.arena.free(rec);
            return Some(Allocation {
                file,
                offset: 0,
                size: space,
            });
        }

        if space == 0 {
            self.arena.free(rec);
            return None;
        }

        let granted = if space < size {
            // Not enough space came back: bank it and report failure.
            self.arena[rec].size = space;
            None
        } else {
            let r = &mut self.arena[rec];
            r.offset = size as u64;
            r.size = space - size;
            Some(Allocation {
                file,
                offset: 0,
                size,
            })
        };

        self.arena[rec].prev = tail;
        match tail {
            Some(t) => self.arena[t].next = Some(rec),
            None => self.unused = Some(rec),
        }
        self.entries += 1;
        granted
    }

    // ------------------------------------------------------------------
    // Placed allocation
    // ------------------------------------------------------------------

    /// Allocate `[offset, offset + size)` in `file`, or fail.
    ///
    /// This is the one path that can carve the middle of an unused region;
    /// the pre-gap head is migrated into the free list before returning so
    /// unused entries stay file tails.
    fn allocate_at(
        &mut self,
        file: u32,
        offset: u64,
        size: u32,
        exact: bool,
    ) -> Option<Allocation> {
        if size == 0 {
            return Some(Allocation {
                file,
                offset,
                size: 0,
            });
        }

        debug!(file, offset, size, exact, "allocate at location");

        let end = offset + size as u64;

        // First free record that reaches past the requested start.
        let mut rec = self.scan_hint((file, offset));
        while let Some(h) = rec {
            let r = &self.arena[h];
            if r.file > file || (r.file == file && r.end() > offset) {
                break;
            }
            rec = r.next;
        }

        if let Some(h) = rec {
            let r = &self.arena[h];
            if r.file == file && r.offset <= offset && r.end() >= end {
                return self.take_at_from_free(h, file, offset, size, exact);
            }
        }

        // Same position among the unused tails.
        let mut u_prev = None;
        let mut u_rec = self.unused;
        while let Some(h) = u_rec {
            let r = &self.arena[h];
            if r.file > file || (r.file == file && r.end() > offset) {
                break;
            }
            u_prev = Some(h);
            u_rec = r.next;
        }

        if let Some(h) = u_rec {
            let r = &self.arena[h];
            if r.file == file && r.offset <= offset && r.end() >= end {
                return self.take_at_from_unused(h, file, offset, size, exact);
            }
        }

        // The range may straddle a free record and the unused tail right
        // behind it (the tail has to come second: unused space sits at the
        // end of its file).
        if let (Some(f), Some(u)) = (rec, u_rec) {
            let (f_file, f_off, f_size) = {
                let r = &self.arena[f];
                (r.file, r.offset, r.size)
            };
            let (u_file, u_off, u_size) = {
                let r = &self.arena[u];
                (r.file, r.offset, r.size)
            };
            if f_file == file
                && u_file == file
                && u_off == f_off + f_size as u64
                && f_off <= offset
                && end <= u_off + u_size as u64
            {
                // Bytes of the free record kept ahead of the grant, and
                // unused bytes left over behind it.
                let start = (offset - f_off) as u32;
                let left = (u_off + u_size as u64 - end) as u32;

                let granted;
                if left == 0 || (!exact && left <= self.append) {
                    granted = f_size - start + u_size;
                    self.release_unused_record(u);
                } else {
                    granted = size;
                    let r = &mut self.arena[u];
                    r.offset = end;
                    r.size = left;
                }

                if start == 0 {
                    self.release_free_record(f).ok()?;
                } else {
                    self.arena[f].size = start;
                    self.size_relink(f, f_size);
                }

                return Some(Allocation {
                    file,
                    offset,
                    size: granted,
                });
            }
        }

        // Instantiate files up to the requested one.
        while u_rec.map_or(true, |h| file > self.arena[h].file) && file >= self.files {
            let fresh = match self.arena.alloc(FreeRecord::new(self.files, 0, 0)) {
                Some(h) => h,
                None => {
                    self.record_error(FreeMapError::PoolExhausted(self.arena.live()));
                    return None;
                }
            };
            let space = match self.provider.new_file(self.files) {
                Some(space) => space,
                None => {
                    self.arena.free(fresh);
                    return None;
                }
            };

            info!(file = self.files, space, "provider appended file");
            self.space += space as u64;
            self.files += 1;

            if space == 0 {
                self.arena.free(fresh);
                continue;
            }

            self.arena[fresh].size = space;
            self.arena[fresh].prev = u_prev;
            match u_prev {
                Some(p) => self.arena[p].next = Some(fresh),
                None => self.unused = Some(fresh),
            }
            self.entries += 1;
            u_prev = Some(fresh);
            u_rec = Some(fresh);
        }

        if let Some(h) = u_rec {
            let r = &self.arena[h];
            if r.file == file && r.offset <= offset && r.end() >= end {
                return self.take_at_from_unused(h, file, offset, size, exact);
            }
        }

        None
    }

    /// Placed grant entirely inside one free record.
    fn take_at_from_free(
        &mut self,
        h: Handle,
        file: u32,
        offset: u64,
        size: u32,
        exact: bool,
    ) -> Option<Allocation> {
        let (rec_offset, rec_size) = {
            let r = &self.arena[h];
            (r.offset, r.size)
        };

        if rec_offset < offset {
            let prefix = (offset - rec_offset) as u32;
            let covered = rec_size - prefix;

            if covered == size || (!exact && self.within_append(covered, size)) {
                // Only the head of the record survives; the slack at the tail
                // joins the grant.
                self.arena[h].size = prefix;
                self.size_relink(h, rec_size);
                return Some(Allocation {
                    file,
                    offset,
                    size: covered,
                });
            }

            // Split: the head stays put, the tail becomes a new record.
            let tail_offset = end_of(offset, size);
            let tail_size = (rec_offset + rec_size as u64 - tail_offset) as u32;
            let tail = match self
                .arena
                .alloc(FreeRecord::new(file, tail_offset, tail_size))
            {
                Some(t) => t,
                None => {
                    self.record_error(FreeMapError::PoolExhausted(self.arena.live()));
                    return None;
                }
            };
            self.arena[h].size = prefix;
            self.size_relink(h, rec_size);

            let next = self.arena[h].next;
            self.free_link(tail, Some(h), next);
            self.size_link(tail);
            self.entries += 1;
            self.index_maybe(tail);

            return Some(Allocation { file, offset, size });
        }

        // The record starts exactly at the requested offset.
        if rec_size == size || (!exact && self.within_append(rec_size, size)) {
            self.release_free_record(h).ok()?;
            return Some(Allocation {
                file,
                offset,
                size: rec_size,
            });
        }

        let old_key = (file, rec_offset);
        {
            let r = &mut self.arena[h];
            r.offset += size as u64;
            r.size -= size;
        }
        self.size_relink(h, rec_size);
        self.index_reposition(h, old_key);
        Some(Allocation { file, offset, size })
    }

    /// Placed grant entirely inside one unused region.
    ///
    /// Unused space is assumed to sit only at the tail of its file; a placed
    /// grant is the one operation that can break that, so the pre-gap head of
    /// the region is moved onto the free list here before anything returns.
    fn take_at_from_unused(
        &mut self,
        u: Handle,
        file: u32,
        offset: u64,
        size: u32,
        exact: bool,
    ) -> Option<Allocation> {
        if self.arena[u].offset != offset {
            let key = (file, offset);
            let mut prev = None;
            let mut cur = self.scan_hint(key);
            while let Some(h) = cur {
                if self.arena[h].key() >= key {
                    break;
                }
                prev = Some(h);
                cur = self.arena[h].next;
            }

            let u_off = self.arena[u].offset;
            let head = (offset - u_off) as u32;

            let abuts = prev.map_or(false, |p| {
                let r = &self.arena[p];
                r.file == file && r.end() == u_off
            });
            if abuts {
                // The head coalesces straight into the preceding free record.
                let p = prev.unwrap();
                let old = self.arena[p].size;
                self.arena[p].size += head;
                self.size_relink(p, old);
            } else {
                let fresh = match self.arena.alloc(FreeRecord::new(file, u_off, head)) {
                    Some(h) => h,
                    None => {
                        self.record_error(FreeMapError::PoolExhausted(self.arena.live()));
                        return None;
                    }
                };
                self.free_link(fresh, prev, cur);
                self.size_link(fresh);
                self.entries += 1;
                self.index_maybe(fresh);
            }

            let r = &mut self.arena[u];
            r.offset = offset;
            r.size -= head;
        }

        debug_assert_eq!(self.arena[u].offset, offset);

        let u_size = self.arena[u].size;
        if u_size == size || (!exact && self.within_append(u_size, size)) {
            self.release_unused_record(u);
            Some(Allocation {
                file,
                offset,
                size: u_size,
            })
        } else {
            let r = &mut self.arena[u];
            r.offset += size as u64;
            r.size -= size;
            Some(Allocation { file, offset, size })
        }
    }

    // ------------------------------------------------------------------
    // Freeing
    // ------------------------------------------------------------------

    /// Return `[offset, offset + size)` in `file` to the map, merging with
    /// contiguous free neighbors. A zero `size` is a no-op.
    pub fn free(&mut self, file: u32, offset: u64, size: u32) -> Result<(), FreeMapError> {
        if size == 0 {
            return Ok(());
        }

        debug!(file, offset, size, "free");

        let key = (file, offset);
        let mut prev = None;
        let mut next = self.scan_hint(key);
        while let Some(h) = next {
            let k = self.arena[h].key();
            if k >= key {
                debug_assert_ne!(k, key, "freeing a range that is already free");
                break;
            }
            prev = Some(h);
            next = self.arena[h].next;
        }

        let prev_abuts = prev.map_or(false, |p| {
            let r = &self.arena[p];
            r.file == file && r.end() == offset
        });
        if prev_abuts {
            let p = prev.unwrap();
            let old = self.arena[p].size;
            self.arena[p].size += size;
            self.size_relink(p, old);

            let next_abuts = next.map_or(false, |n| {
                let r = &self.arena[n];
                r.file == file && end_of(offset, size) == r.offset
            });
            if next_abuts {
                // Three-way merge: the successor is absorbed whole.
                let n = next.unwrap();
                let n_size = self.arena[n].size;
                let old = self.arena[p].size;
                self.arena[p].size += n_size;
                self.size_relink(p, old);
                self.release_free_record(n)?;
            }
            self.verify();
            return Ok(());
        }

        let next_abuts = next.map_or(false, |n| {
            let r = &self.arena[n];
            r.file == file && end_of(offset, size) == r.offset
        });
        if next_abuts {
            let n = next.unwrap();
            let (old_size, old_key) = {
                let r = &self.arena[n];
                (r.size, r.key())
            };
            {
                let r = &mut self.arena[n];
                r.offset -= size as u64;
                r.size += size;
            }
            self.size_relink(n, old_size);
            self.index_reposition(n, old_key);
            self.verify();
            return Ok(());
        }

        // Disjoint from both neighbors: a new record.
        let fresh = match self.arena.alloc(FreeRecord::new(file, offset, size)) {
            Some(h) => h,
            None => {
                let err = FreeMapError::PoolExhausted(self.arena.live());
                self.record_error(err.clone());
                return Err(err);
            }
        };
        self.free_link(fresh, prev, next);
        self.size_link(fresh);
        self.entries += 1;
        self.index_maybe(fresh);
        self.verify();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resize in place
    // ------------------------------------------------------------------

    /// Grow the allocation at `(file, offset, size)` by `additional` bytes
    /// without moving it.
    ///
    /// Succeeds only when the free or unused region immediately behind the
    /// allocation covers `additional`; returns the granted byte count, which
    /// can exceed `additional` by up to the append budget unless `exact`.
    /// The map never shrinks or relocates an allocation.
    pub fn grow_in_place(
        &mut self,
        file: u32,
        offset: u64,
        size: u32,
        additional: u32,
        exact: bool,
    ) -> Option<u32> {
        debug!(file, offset, size, additional, exact, "grow in place");

        let key = (file, end_of(offset, size));

        let mut cur = self.scan_hint(key);
        while let Some(h) = cur {
            if self.arena[h].key() >= key {
                break;
            }
            cur = self.arena[h].next;
        }

        if let Some(h) = cur {
            let r = &self.arena[h];
            if r.file == file && r.offset == key.1 && r.size >= additional {
                let rec_size = r.size;
                let granted = if rec_size == additional
                    || (!exact && self.within_append(rec_size, additional))
                {
                    if self.release_free_record(h).is_err() {
                        self.verify();
                        return None;
                    }
                    rec_size
                } else {
                    let old_key = (file, key.1);
                    {
                        let r = &mut self.arena[h];
                        r.offset += additional as u64;
                        r.size -= additional;
                    }
                    self.size_relink(h, rec_size);
                    self.index_reposition(h, old_key);
                    additional
                };
                self.verify();
                return Some(granted);
            }
        }

        // Otherwise the file's unused tail may start right behind us.
        let mut cur = self.unused;
        while let Some(h) = cur {
            if self.arena[h].key() >= key {
                break;
            }
            cur = self.arena[h].next;
        }

        if let Some(h) = cur {
            let r = &self.arena[h];
            if r.file == file && r.offset == key.1 && r.size >= additional {
                let rec_size = r.size;
                let granted = if rec_size == additional
                    || (!exact && self.within_append(rec_size, additional))
                {
                    self.release_unused_record(h);
                    rec_size
                } else {
                    let r = &mut self.arena[h];
                    r.offset += additional as u64;
                    r.size -= additional;
                    additional
                };
                self.verify();
                return Some(granted);
            }
        }

        self.verify();
        None
    }

    // ------------------------------------------------------------------
    // Accounting and introspection
    // ------------------------------------------------------------------

    /// Take `size` bytes out of management permanently, counting them as
    /// wasted. The range itself is simply never offered again.
    pub fn waste(&mut self, _file: u32, _offset: u64, size: u32) {
        self.wasted += size as u64;
    }

    /// The most recent fault, if any. Capacity exhaustion is not a fault.
    pub fn last_error(&self) -> Option<&FreeMapError> {
        self.last_error.as_ref()
    }

    /// Fraction of carved space currently allocated: `1 - free/(total-unused)`,
    /// or 1.0 for an untouched map. Walks both lists.
    pub fn utilisation(&self) -> f64 {
        let free: u64 = self.free_regions().map(|r| r.size as u64).sum();
        let unused: u64 = self.unused_regions().map(|r| r.size as u64).sum();

        if self.space == unused {
            1.0
        } else {
            (self.space - (unused + free)) as f64 / (self.space - unused) as f64
        }
    }

    /// Total bytes under management, excluding never-carved unused tails.
    /// Walks the unused list.
    pub fn space(&self) -> u64 {
        let unused: u64 = self.unused_regions().map(|r| r.size as u64).sum();
        self.space - unused
    }

    /// Bytes permanently taken out of management via [`FreeMap::waste`].
    pub fn wasted(&self) -> u64 {
        self.wasted
    }

    /// Number of free plus unused records.
    pub fn entry_count(&self) -> u32 {
        self.entries
    }

    /// Number of records currently in the scan index.
    pub fn indexed_entry_count(&self) -> usize {
        self.index.len()
    }

    pub fn append_budget(&self) -> u32 {
        self.append
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Number of files instantiated through the provider.
    pub fn file_count(&self) -> u32 {
        self.files
    }

    /// Free records in (file, offset) order.
    pub fn free_regions(&self) -> Regions<'_> {
        Regions {
            map: self,
            cur: self.first,
        }
    }

    /// Unused tail records in file order.
    pub fn unused_regions(&self) -> Regions<'_> {
        Regions {
            map: self,
            cur: self.unused,
        }
    }

    /// Write a per-record listing, free records first.
    pub fn dump<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let mut cur = self.first;
        while let Some(h) = cur {
            let r = &self.arena[h];
            writeln!(
                out,
                "({} {}) size {}{}",
                r.file,
                r.offset,
                r.size,
                if r.indexed { " (indexed)" } else { "" }
            )?;
            cur = r.next;
        }
        let mut cur = self.unused;
        while let Some(h) = cur {
            let r = &self.arena[h];
            writeln!(out, "({} {}) size {} (unused)", r.file, r.offset, r.size)?;
            cur = r.next;
        }
        Ok(())
    }

    /// Write per-size-class occupancy followed by the unused listing.
    pub fn profile<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let total = self.space() as f64;
        for class in 0..SIZE_CLASSES {
            let mut count = 0u32;
            let mut bytes = 0u64;
            let mut cur = self.size_heads[class];
            while let Some(h) = cur {
                let r = &self.arena[h];
                count += 1;
                bytes += r.size as u64;
                cur = r.next_size;
            }
            let low = 1u64 << class;
            let high = low + (low - 1);
            let pct = if total > 0.0 {
                bytes as f64 * 100.0 / total
            } else {
                0.0
            };
            writeln!(
                out,
                "{} - {}: {} entries {} bytes, {:.3}%",
                low, high, count, bytes, pct
            )?;
        }
        let mut cur = self.unused;
        while let Some(h) = cur {
            let r = &self.arena[h];
            writeln!(out, "unused: {} {} {}", r.file, r.offset, r.size)?;
            cur = r.next;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Exhaustively walk every view of the map and report whether they agree.
    ///
    /// O(n²) in places; meant for tests. With the `exhaustive-checks` feature
    /// enabled, debug builds run it after every public operation.
    pub fn check_invariants(&self) -> bool {
        let limit = self.arena.live() + 1;

        // Free list: back links, strict sort, no zero sizes, no overlap or
        // adjacency within a file (adjacency means a missed coalesce).
        let mut free_count = 0usize;
        let mut indexed_count = 0usize;
        let mut prev: Option<Handle> = None;
        let mut cur = self.first;
        while let Some(h) = cur {
            if free_count >= limit {
                return false;
            }
            let Some(r) = self.arena.get(h) else {
                return false;
            };
            if r.prev != prev || r.size == 0 {
                return false;
            }
            if let Some(p) = prev {
                let pr = &self.arena[p];
                if pr.key() >= r.key() {
                    return false;
                }
                if pr.file == r.file && r.offset <= pr.end() {
                    return false;
                }
            }
            if r.indexed {
                indexed_count += 1;
            }
            free_count += 1;
            prev = Some(h);
            cur = r.next;
        }

        // Size lists: back links, bucket formula, head/tail anchors.
        let mut size_count = 0usize;
        for class in 0..SIZE_CLASSES {
            let mut prev: Option<Handle> = None;
            let mut cur = self.size_heads[class];
            let mut steps = 0usize;
            while let Some(h) = cur {
                if steps >= limit {
                    return false;
                }
                let Some(r) = self.arena.get(h) else {
                    return false;
                };
                if r.prev_size != prev || size_class(r.size) != class {
                    return false;
                }
                size_count += 1;
                steps += 1;
                prev = Some(h);
                cur = r.next_size;
            }
            if self.size_tails[class] != prev {
                return false;
            }
        }
        if size_count != free_count {
            return false;
        }

        // Unused list: back links, never indexed or size-linked, sorted, at
        // most one entry per file.
        let mut unused_count = 0usize;
        let mut prev: Option<Handle> = None;
        let mut cur = self.unused;
        while let Some(h) = cur {
            if unused_count >= limit {
                return false;
            }
            let Some(r) = self.arena.get(h) else {
                return false;
            };
            if r.prev != prev {
                return false;
            }
            if r.indexed || r.prev_size.is_some() || r.next_size.is_some() {
                return false;
            }
            if let Some(p) = prev {
                let pr = &self.arena[p];
                if pr.file == r.file || pr.key() >= r.key() {
                    return false;
                }
            }
            unused_count += 1;
            prev = Some(h);
            cur = r.next;
        }

        if self.entries as usize != free_count + unused_count {
            return false;
        }
        if self.arena.live() != free_count + unused_count {
            return false;
        }

        // Free and unused space never overlaps, and every unused region sits
        // past every free record of its file.
        for u in self.unused_regions() {
            for f in self.free_regions() {
                if f.file == u.file && f.offset + f.size as u64 > u.offset {
                    return false;
                }
            }
        }

        // Scan index agrees with the indexed flags.
        if self.index.len() != indexed_count {
            return false;
        }
        for (key, h) in self.index.iter() {
            let Some(r) = self.arena.get(h) else {
                return false;
            };
            if !r.indexed || r.key() != key {
                return false;
            }
        }

        true
    }

    fn verify(&self) {
        #[cfg(feature = "exhaustive-checks")]
        debug_assert!(self.check_invariants(), "free map invariants violated");
    }

    // ------------------------------------------------------------------
    // List and index plumbing
    // ------------------------------------------------------------------

    fn within_append(&self, have: u32, want: u32) -> bool {
        have as u64 <= want as u64 + self.append as u64
    }

    fn record_error(&mut self, err: FreeMapError) {
        self.last_error = Some(err);
    }

    /// Scan start for `key`: the indexed hint at or below it, else the head.
    fn scan_hint(&self, key: (u32, u64)) -> Option<Handle> {
        self.index.nearest_at_or_below(key).or(self.first)
    }

    /// Splice `h` into the sorted free list between `prev` and `next`.
    fn free_link(&mut self, h: Handle, prev: Option<Handle>, next: Option<Handle>) {
        {
            let r = &mut self.arena[h];
            r.prev = prev;
            r.next = next;
        }
        match prev {
            Some(p) => self.arena[p].next = Some(h),
            None => self.first = Some(h),
        }
        if let Some(n) = next {
            self.arena[n].prev = Some(h);
        }
    }

    fn free_unlink(&mut self, h: Handle) {
        let (prev, next) = {
            let r = &self.arena[h];
            (r.prev, r.next)
        };
        match prev {
            Some(p) => self.arena[p].next = next,
            None => self.first = next,
        }
        if let Some(n) = next {
            self.arena[n].prev = prev;
        }
        let r = &mut self.arena[h];
        r.prev = None;
        r.next = None;
    }

    fn unused_unlink(&mut self, h: Handle) {
        let (prev, next) = {
            let r = &self.arena[h];
            (r.prev, r.next)
        };
        match prev {
            Some(p) => self.arena[p].next = next,
            None => self.unused = next,
        }
        if let Some(n) = next {
            self.arena[n].prev = prev;
        }
        let r = &mut self.arena[h];
        r.prev = None;
        r.next = None;
    }

    /// Append `h` to the tail of its size-class list.
    fn size_link(&mut self, h: Handle) {
        let class = size_class(self.arena[h].size);
        debug_assert!(self.arena[h].prev_size.is_none() && self.arena[h].next_size.is_none());

        let tail = self.size_tails[class];
        self.arena[h].prev_size = tail;
        match tail {
            Some(t) => self.arena[t].next_size = Some(h),
            None => self.size_heads[class] = Some(h),
        }
        self.size_tails[class] = Some(h);
    }

    /// Remove `h` from the size-class list it was filed under when its size
    /// was `old_size`.
    fn size_unlink(&mut self, h: Handle, old_size: u32) {
        let class = size_class(old_size);
        let (prev, next) = {
            let r = &self.arena[h];
            (r.prev_size, r.next_size)
        };
        match prev {
            Some(p) => self.arena[p].next_size = next,
            None => self.size_heads[class] = next,
        }
        match next {
            Some(n) => self.arena[n].prev_size = prev,
            None => self.size_tails[class] = prev,
        }
        let r = &mut self.arena[h];
        r.prev_size = None;
        r.next_size = None;
    }

    /// Refile `h` after a size change; the bucket may differ.
    fn size_relink(&mut self, h: Handle, old_size: u32) {
        self.size_unlink(h, old_size);
        self.size_link(h);
    }

    /// Coin flip on whether `h` joins the scan index.
    fn index_maybe(&mut self, h: Handle) {
        if self.rng.next_u32() <= self.index_mark {
            let key = self.arena[h].key();
            self.index.insert(key, h);
            self.arena[h].indexed = true;
        }
    }

    /// Drop `h` from the scan index if it is a member. A miss means the index
    /// fell out of sync with the free list: the fault is recorded and
    /// returned, but callers still release the record (a stale index beats a
    /// leaked one).
    fn index_unlink(&mut self, h: Handle) -> Result<(), FreeMapError> {
        let (indexed, key) = {
            let r = &self.arena[h];
            (r.indexed, r.key())
        };
        if !indexed {
            return Ok(());
        }
        self.arena[h].indexed = false;
        if self.index.remove(key).is_some() {
            Ok(())
        } else {
            let err = FreeMapError::IndexDesync {
                file: key.0,
                offset: key.1,
            };
            self.record_error(err.clone());
            Err(err)
        }
    }

    /// Move an indexed record's key after its offset changed.
    fn index_reposition(&mut self, h: Handle, old_key: (u32, u64)) {
        if !self.arena[h].indexed {
            return;
        }
        if self.index.remove(old_key).is_some() {
            let key = self.arena[h].key();
            self.index.insert(key, h);
        } else {
            self.arena[h].indexed = false;
            self.record_error(FreeMapError::IndexDesync {
                file: old_key.0,
                offset: old_key.1,
            });
        }
    }

    /// Unlink a free-list record from every view and return its node to the
    /// arena. An error means the index was out of sync (fault recorded); the
    /// node is released regardless.
    fn release_free_record(&mut self, h: Handle) -> Result<(), FreeMapError> {
        let size = self.arena[h].size;
        self.size_unlink(h, size);
        self.free_unlink(h);
        let unlinked = self.index_unlink(h);
        self.arena.free(h);
        self.entries -= 1;
        unlinked
    }

    fn release_unused_record(&mut self, h: Handle) {
        debug_assert!(!self.arena[h].indexed);
        self.unused_unlink(h);
        self.arena.free(h);
        self.entries -= 1;
    }
}

impl Drop for FreeMap {
    fn drop(&mut self) {
        // Teardown is structural (the arena owns every node); only the
        // consistency assertion from the debug feature runs here.
        self.verify();
    }
}

impl fmt::Debug for FreeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeMap")
            .field("strategy", &self.strategy)
            .field("entries", &self.entries)
            .field("indexed", &self.index.len())
            .field("files", &self.files)
            .field("append", &self.append)
            .field("space", &self.space)
            .field("wasted", &self.wasted)
            .finish_non_exhaustive()
    }
}

/// Iterator over a location list, yielding plain regions.
pub struct Regions<'a> {
    map: &'a FreeMap,
    cur: Option<Handle>,
}

impl Iterator for Regions<'_> {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        let h = self.cur?;
        let r = &self.map.arena[h];
        self.cur = r.next;
        Some(Region {
            file: r.file,
            offset: r.offset,
            size: r.size,
        })
    }
}

fn end_of(offset: u64, size: u32) -> u64 {
    offset + size as u64
}
