//! Property-based tests for free-map correctness
//!
//! Uses proptest to verify map-wide invariants hold across many random
//! allocate/free scripts.

use freemap_rs::{AllocOptions, FreeMap, Region, Strategy};
use proptest::prelude::*;

const FILE_SIZE: u32 = 4096;

fn build(strategy: Strategy, append: u32) -> FreeMap {
    FreeMap::new(strategy, append, |_file: u32| Some(FILE_SIZE))
}

fn any_fit() -> impl proptest::strategy::Strategy<Value = Strategy> {
    prop_oneof![
        Just(Strategy::First),
        Just(Strategy::Close),
        Just(Strategy::Best),
        Just(Strategy::Worst),
    ]
}

fn free_bytes(map: &FreeMap) -> u64 {
    map.free_regions().map(|r| r.size as u64).sum()
}

fn unused_bytes(map: &FreeMap) -> u64 {
    map.unused_regions().map(|r| r.size as u64).sum()
}

fn provided_bytes(map: &FreeMap) -> u64 {
    map.file_count() as u64 * FILE_SIZE as u64
}

/// Punch holes of the given sizes into a fresh file, separated by 1-byte
/// allocations so they never coalesce.
fn carve_holes(map: &mut FreeMap, hole_sizes: &[u32]) {
    let mut to_free = Vec::new();
    for &size in hole_sizes {
        to_free.push(map.allocate_exact(size).expect("file fits all holes"));
        map.allocate_exact(1).expect("separator");
    }
    for a in to_free {
        map.free(a.file, a.offset, a.size).unwrap();
    }
}

proptest! {
    #[test]
    fn prop_allocation_and_release_conserve_space(
        sizes in prop::collection::vec(1u32..512, 1..40),
        strategy in any_fit()
    ) {
        let mut map = build(strategy, 0);
        let mut live = Vec::new();

        for size in sizes {
            if let Some(a) = map.allocate_exact(size) {
                prop_assert_eq!(a.size, size);
                live.push(a);
            }
        }
        prop_assert!(map.check_invariants());

        let allocated: u64 = live.iter().map(|a| a.size as u64).sum();
        prop_assert_eq!(
            allocated + free_bytes(&map) + unused_bytes(&map),
            provided_bytes(&map)
        );

        for a in live {
            map.free(a.file, a.offset, a.size).unwrap();
        }
        prop_assert!(map.check_invariants());
        prop_assert_eq!(free_bytes(&map) + unused_bytes(&map), provided_bytes(&map));
    }

    #[test]
    fn prop_grants_never_overlap(
        sizes in prop::collection::vec(1u32..256, 1..50),
        strategy in any_fit()
    ) {
        let mut map = build(strategy, 8);
        let mut grants = Vec::new();

        for size in sizes {
            if let Some(a) = map.allocate(size) {
                prop_assert!(a.size >= size);
                grants.push(a);
            }
        }

        grants.sort_by_key(|a| (a.file, a.offset));
        for pair in grants.windows(2) {
            if pair[0].file == pair[1].file {
                prop_assert!(
                    pair[0].offset + pair[0].size as u64 <= pair[1].offset,
                    "grants overlap: {:?} and {:?}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn prop_round_trip_restores_free_bytes(size in 1u32..FILE_SIZE, strategy in any_fit()) {
        let mut map = build(strategy, 0);

        let a = map.allocate_exact(size).unwrap();
        let entries_held = map.entry_count();
        map.free(a.file, a.offset, a.size).unwrap();

        prop_assert!(map.check_invariants());
        prop_assert_eq!(free_bytes(&map) + unused_bytes(&map), provided_bytes(&map));
        // The freed range becomes one record (nothing to coalesce with).
        prop_assert_eq!(map.entry_count(), entries_held + 1);
    }

    #[test]
    fn prop_best_fit_returns_global_minimum(
        holes in prop::collection::vec(1u32..=200, 1..8),
        request in 1u32..=200
    ) {
        prop_assume!(holes.iter().any(|&h| h >= request));

        let mut map = build(Strategy::Best, 0);
        carve_holes(&mut map, &holes);
        let regions: Vec<Region> = map.free_regions().collect();

        let expected = regions
            .iter()
            .filter(|r| r.size >= request)
            .map(|r| r.size)
            .min()
            .unwrap();

        let a = map.allocate_exact(request).unwrap();
        let chosen = regions
            .iter()
            .find(|r| r.file == a.file && r.offset == a.offset)
            .expect("grant must come from a recorded hole");
        prop_assert_eq!(chosen.size, expected);
    }

    #[test]
    fn prop_worst_fit_returns_global_maximum(
        holes in prop::collection::vec(1u32..=200, 1..8),
        request in 1u32..=200
    ) {
        prop_assume!(holes.iter().any(|&h| h >= request));

        let mut map = build(Strategy::Worst, 0);
        carve_holes(&mut map, &holes);
        let regions: Vec<Region> = map.free_regions().collect();

        let expected = regions
            .iter()
            .filter(|r| r.size >= request)
            .map(|r| r.size)
            .max()
            .unwrap();

        let a = map.allocate_exact(request).unwrap();
        let chosen = regions
            .iter()
            .find(|r| r.file == a.file && r.offset == a.offset)
            .expect("grant must come from a recorded hole");
        prop_assert_eq!(chosen.size, expected);
    }

    #[test]
    fn prop_first_fit_returns_earliest_hole(
        holes in prop::collection::vec(1u32..=200, 1..8),
        request in 1u32..=200
    ) {
        prop_assume!(holes.iter().any(|&h| h >= request));

        let mut map = build(Strategy::First, 0);
        carve_holes(&mut map, &holes);
        let regions: Vec<Region> = map.free_regions().collect();

        // free_regions walks the sorted list, so the first qualifier in
        // iteration order is the earliest by (file, offset).
        let expected = regions.iter().find(|r| r.size >= request).unwrap();

        let a = map.allocate_exact(request).unwrap();
        prop_assert_eq!((a.file, a.offset), (expected.file, expected.offset));
    }

    #[test]
    fn prop_placed_allocation_takes_exact_hole(
        holes in prop::collection::vec(1u32..=200, 1..8),
        pick in any::<prop::sample::Index>()
    ) {
        let mut map = build(Strategy::Close, 0);
        carve_holes(&mut map, &holes);
        let regions: Vec<Region> = map.free_regions().collect();
        let target = regions[pick.index(regions.len())];

        let a = map
            .allocate_with(target.size, AllocOptions::exact_at(target.file, target.offset))
            .expect("hole is free");
        prop_assert_eq!((a.file, a.offset, a.size), (target.file, target.offset, target.size));
        prop_assert!(map.check_invariants());

        map.free(a.file, a.offset, a.size).unwrap();
        // Only the 1-byte separators stay allocated.
        prop_assert_eq!(
            free_bytes(&map) + unused_bytes(&map),
            provided_bytes(&map) - holes.len() as u64
        );
    }

    #[test]
    fn prop_mixed_churn_keeps_invariants(
        ops in prop::collection::vec((any::<bool>(), 1u32..600), 1..60),
        strategy in any_fit()
    ) {
        let mut map = build(strategy, 8);
        let mut live = Vec::new();

        for (do_alloc, size) in ops {
            if do_alloc || live.is_empty() {
                if let Some(a) = map.allocate(size) {
                    prop_assert!(a.size >= size);
                    live.push(a);
                }
            } else {
                let a = live.remove(size as usize % live.len());
                map.free(a.file, a.offset, a.size).unwrap();
            }

            prop_assert!(map.check_invariants());
            let allocated: u64 = live.iter().map(|a| a.size as u64).sum();
            prop_assert_eq!(
                allocated + free_bytes(&map) + unused_bytes(&map),
                provided_bytes(&map)
            );
        }
    }
}
