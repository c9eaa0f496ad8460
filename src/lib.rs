//! # freemap-rs - Segmented Free-Space Map for Multi-File Storage
//!
//! `freemap-rs` tracks free space across a growable collection of numbered
//! storage files, addressed by `(file, offset)`. It plays the role a heap
//! allocator plays for RAM, except that the addressable space is effectively
//! unbounded (a caller-supplied provider appends new files on demand) and
//! the map performs no I/O of its own: it hands out and takes back abstract
//! `(file, offset, length)` ranges for a higher layer (a disk B-tree, a
//! document store) to fill.
//!
//! Internals, briefly: all free ranges sit on one sorted linked list,
//! cross-linked into 32 power-of-two size-class lists for fast "large enough"
//! lookup, with a probabilistic location index that stays sublinear in the
//! record count and only ever serves as a scan hint. Adjacent ranges coalesce
//! on free, and each file's never-carved tail is kept out of the size classes
//! as an "unused" region until it is first needed.
//!
//! ## Quick Start
//!
//! ```rust
//! use freemap_rs::{FreeMap, Strategy};
//!
//! # fn main() -> Result<(), freemap_rs::FreeMapError> {
//! // Files of 1 MiB are appended as needed.
//! let mut map = FreeMap::new(Strategy::Close, 16, |_file: u32| Some(1u32 << 20));
//!
//! let grant = map.allocate(4096).expect("provider supplies space");
//! assert_eq!((grant.file, grant.offset), (0, 0));
//!
//! // Ranges are returned with the exact granted triple.
//! map.free(grant.file, grant.offset, grant.size)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Advanced Usage
//!
//! ```rust
//! use freemap_rs::{FreeMap, Strategy};
//!
//! # fn main() -> Result<(), freemap_rs::FreeMapError> {
//! let mut map = FreeMap::builder()
//!     .strategy(Strategy::Best)
//!     .append_budget(32)      // round grants up to avoid tiny fragments
//!     .index_fraction(0.2)    // share of records entering the scan index
//!     .provider(|file: u32| if file < 4 { Some(1u32 << 16) } else { None })
//!     .build()?;
//!
//! let grant = map.allocate_exact(512).expect("space available");
//! map.free(grant.file, grant.offset, grant.size)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! The map is in-memory bookkeeping only. To survive a restart, snapshot
//! [`FreeMap::free_regions`] and [`FreeMap::unused_regions`] (both yield
//! serde-serializable [`Region`] values) and replay them into a fresh map
//! with [`FreeMap::free`], or rebuild from scratch.

pub mod core;
pub mod error;

pub use crate::core::freemap::{
    AllocOptions, Allocation, FileProvider, FreeMap, Region, Regions, Strategy,
};
pub use crate::error::{FreeMapError, Result};

use crate::core::freemap::DEFAULT_INDEX_FRACTION;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Builder for customizing map construction
///
/// # Examples
///
/// ```rust
/// use freemap_rs::{FreeMap, Strategy};
///
/// # fn main() -> freemap_rs::Result<()> {
/// let map = FreeMap::builder()
///     .strategy(Strategy::Worst)
///     .append_budget(8)
///     .record_limit(1 << 16)
///     .provider(|_file: u32| Some(4096u32))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct FreeMapBuilder {
    strategy: Strategy,
    append: u32,
    index_fraction: f64,
    record_limit: Option<usize>,
    rng: Option<Box<dyn RngCore>>,
    provider: Option<Box<dyn FileProvider>>,
}

impl FreeMapBuilder {
    pub fn new() -> Self {
        FreeMapBuilder {
            strategy: Strategy::Close,
            append: 0,
            index_fraction: DEFAULT_INDEX_FRACTION,
            record_limit: None,
            rng: None,
            provider: None,
        }
    }

    /// Candidate-selection strategy (defaults to [`Strategy::Close`]).
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Extra bytes a grant may be rounded up by to avoid leaving tiny
    /// fragments (defaults to 0).
    pub fn append_budget(mut self, bytes: u32) -> Self {
        self.append = bytes;
        self
    }

    /// Share of records entering the scan index, in `[0.0, 1.0]`.
    pub fn index_fraction(mut self, fraction: f64) -> Self {
        self.index_fraction = fraction;
        self
    }

    /// Cap the record arena at `records` live nodes. Exceeding the cap
    /// records [`FreeMapError::PoolExhausted`] and fails the operation.
    pub fn record_limit(mut self, records: usize) -> Self {
        self.record_limit = Some(records);
        self
    }

    /// Inject the RNG behind the index-membership coin flip. Tests use this
    /// to make index membership deterministic.
    pub fn rng(mut self, rng: Box<dyn RngCore>) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Set the growth provider (required).
    pub fn provider<P: FileProvider + 'static>(mut self, provider: P) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    /// Build the map instance.
    pub fn build(self) -> Result<FreeMap> {
        let provider = self
            .provider
            .ok_or_else(|| FreeMapError::Config("a file provider must be set".into()))?;

        if !(0.0..=1.0).contains(&self.index_fraction) {
            return Err(FreeMapError::Config(format!(
                "index fraction {} outside [0, 1]",
                self.index_fraction
            )));
        }

        let rng = self
            .rng
            .unwrap_or_else(|| Box::new(SmallRng::from_entropy()));

        Ok(FreeMap::with_parts(
            self.strategy,
            self.append,
            self.index_fraction,
            self.record_limit,
            rng,
            provider,
        ))
    }
}

impl Default for FreeMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeMap {
    /// Start building a map with non-default configuration.
    pub fn builder() -> FreeMapBuilder {
        FreeMapBuilder::new()
    }
}
