#![forbid(unsafe_code)]
//! Extent allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **FreeSpaceCtl** — per-group index of free ranges, by offset and by size.
//! 2. **BlockGroup / SpaceInfo** — byte counters per group and per kind.
//! 3. **Caching** — lazy loading of a group's free space from the extent tree.
//! 4. **FsAlloc** — the multi-phase extent search, reservations, pinning and
//!    the commit-time unpin.
//!
//! Zoned groups, trimming, and the split-allocation worker pool sit beside
//! the search.

pub mod allocator;
pub mod block_group;
pub mod caching;
pub mod cluster;
pub mod free_space;
pub mod pin;
pub mod space_info;
pub mod split_alloc;
pub mod trim;
pub mod zoned;

pub use allocator::{
    AllocConfig, AllocRequest, AllocSnapshot, FoundExtent, FsAlloc, LoopPhase, SpaceInfoSnapshot,
};
pub use block_group::{BlockGroup, BlockGroupSnapshot, CacheState, SizeClass};
pub use free_space::FreeSpaceCtl;
pub use pin::{PinTracker, PinnedExtents};
pub use space_info::{SpaceCounters, SpaceInfo, SubGroup};
pub use split_alloc::{ReclaimFlags, SplitAllocPool};
pub use trim::TrimReport;
pub use zoned::DedicatedGroups;
