//! Device groups: one chunk's worth of logical address space with its own
//! free-space index and byte counters.
//!
//! Lock order is the space info's lock, then the group's. Every counter that
//! exists on both is moved under both locks at once.

use crate::free_space::FreeSpaceCtl;
use crate::space_info::{SpaceCounters, SpaceInfo};
use fxt_error::{FxtError, Result};
use fxt_types::{BlockGroupFlags, PhysRange, SZ_128K, SZ_8M};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Coarse extent-size bucket a data group commits to on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    None,
    Small,
    Medium,
    Large,
}

impl SizeClass {
    #[must_use]
    pub fn for_size(bytes: u64) -> Self {
        if bytes <= SZ_128K {
            Self::Small
        } else if bytes <= SZ_8M {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

/// Progress of loading a group's free space from the extent tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    NotStarted,
    Started,
    Finished,
    Error,
}

#[derive(Debug)]
pub struct BlockGroupState {
    pub used: u64,
    pub reserved: u64,
    pub pinned: u64,
    pub bytes_super: u64,
    pub zone_unusable: u64,
    pub delalloc_bytes: u64,
    /// Read-only nesting count.
    pub ro: u32,
    pub size_class: SizeClass,
    pub cached: CacheState,
    /// Free space below this logical offset has been loaded.
    pub caching_progress: u64,
    /// Smallest extent the loader has seen, zero if none.
    pub caching_min_extent: u64,
    pub free_space: FreeSpaceCtl,
    /// Zoned groups: write pointer, relative to the group start.
    pub alloc_offset: u64,
    pub zone_capacity: u64,
    /// Zoned groups: bytes between the write pointer and the capacity.
    pub zone_free: u64,
    /// Zoned groups: group serves data relocation only.
    pub zoned_data_reloc: bool,
    /// Superblock copies inside this group, never handed out.
    pub super_stripes: Vec<PhysRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupSnapshot {
    pub start: u64,
    pub length: u64,
    pub flags: BlockGroupFlags,
    pub used: u64,
    pub reserved: u64,
    pub pinned: u64,
    pub bytes_super: u64,
    pub zone_unusable: u64,
    pub free: u64,
    pub readonly: bool,
    pub size_class: SizeClass,
    pub cached: CacheState,
}

#[derive(Debug)]
pub struct BlockGroup {
    start: u64,
    length: u64,
    flags: BlockGroupFlags,
    zoned: bool,
    space_info: Arc<SpaceInfo>,
    state: Mutex<BlockGroupState>,
}

impl BlockGroup {
    /// A group with no free space loaded yet.
    ///
    /// `super_stripes` must already be clipped to the group.
    #[must_use]
    pub fn new(
        start: u64,
        length: u64,
        flags: BlockGroupFlags,
        space_info: Arc<SpaceInfo>,
        sectorsize: u64,
        zoned: bool,
        super_stripes: Vec<PhysRange>,
    ) -> Self {
        let bytes_super = super_stripes.iter().map(|r| r.len).sum();
        Self {
            start,
            length,
            flags,
            zoned,
            space_info,
            state: Mutex::new(BlockGroupState {
                used: 0,
                reserved: 0,
                pinned: 0,
                bytes_super,
                zone_unusable: 0,
                delalloc_bytes: 0,
                ro: 0,
                size_class: SizeClass::None,
                cached: CacheState::NotStarted,
                caching_progress: start,
                caching_min_extent: 0,
                free_space: FreeSpaceCtl::new(start, sectorsize),
                alloc_offset: 0,
                zone_capacity: length,
                zone_free: 0,
                zoned_data_reloc: false,
                super_stripes,
            }),
        }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    #[must_use]
    pub fn range(&self) -> PhysRange {
        PhysRange::new(self.start, self.length)
    }

    #[must_use]
    pub fn flags(&self) -> BlockGroupFlags {
        self.flags
    }

    #[must_use]
    pub fn is_zoned(&self) -> bool {
        self.zoned
    }

    #[must_use]
    pub fn space_info(&self) -> &Arc<SpaceInfo> {
        &self.space_info
    }

    pub fn lock(&self) -> MutexGuard<'_, BlockGroupState> {
        self.state.lock()
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.state.lock().cached == CacheState::Finished
    }

    /// Loading has ended, successfully or not.
    #[must_use]
    pub fn is_caching_done(&self) -> bool {
        matches!(self.state.lock().cached, CacheState::Finished | CacheState::Error)
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.state.lock().ro > 0
    }

    /// Whether the group's flags carry every bit in `bits`.
    #[must_use]
    pub fn has_bits(&self, bits: BlockGroupFlags) -> bool {
        self.flags.contains(bits)
    }

    #[must_use]
    pub fn is_data_only(&self) -> bool {
        self.flags.is_data() && !self.flags.contains(BlockGroupFlags::METADATA)
    }

    /// Size classes apply to non-zoned data-only groups.
    #[must_use]
    pub fn should_use_size_class(&self, enabled: bool) -> bool {
        enabled && !self.zoned && self.is_data_only()
    }

    /// Free bytes the allocator may still hand out.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        let state = self.state.lock();
        if self.zoned {
            state.zone_free
        } else {
            state.free_space.free_space()
        }
    }

    fn with_counters<R>(&self, f: impl FnOnce(&mut SpaceCounters, &mut BlockGroupState) -> R) -> R {
        let mut sinfo = self.space_info.lock();
        let mut state = self.state.lock();
        f(&mut sinfo.counters, &mut state)
    }

    /// Hand every byte of a freshly created group to its free-space index.
    pub(crate) fn init_empty(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.zoned {
            state.zone_free = state.zone_capacity;
        } else {
            let stripes = state.super_stripes.clone();
            let mut cursor = self.start;
            for stripe in stripes {
                if stripe.start > cursor {
                    state.free_space.add_free_space(cursor, stripe.start - cursor)?;
                }
                cursor = cursor.max(stripe.end());
            }
            if cursor < self.end() {
                state.free_space.add_free_space(cursor, self.end() - cursor)?;
            }
        }
        state.cached = CacheState::Finished;
        state.caching_progress = self.end();
        Ok(())
    }

    /// Return `[start, start + len)` to the free pool.
    ///
    /// On a group still loading its free space only the part below the
    /// loading cursor is added; the loader finds the rest itself.
    pub fn add_free_space(&self, start: u64, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        if self.zoned {
            zoned_add_free(&mut state, self.start, self.length, start, len, self.zoned);
            return Ok(());
        }
        let end = if state.cached == CacheState::Finished {
            start.saturating_add(len)
        } else {
            start.saturating_add(len).min(state.caching_progress)
        };
        if end <= start {
            return Ok(());
        }
        state.free_space.add_free_space(start, end - start)
    }

    /// Account `num_bytes` just taken from the free pool as reserved.
    ///
    /// Fails with `Again` if the group turned read-only or belongs to a
    /// different size class and `force_wrong_size_class` is unset.
    pub fn add_reserved_bytes(
        &self,
        ram_bytes: u64,
        num_bytes: u64,
        delalloc: bool,
        force_wrong_size_class: bool,
        size_classes: bool,
    ) -> Result<()> {
        let use_class = self.should_use_size_class(size_classes);
        self.with_counters(|sinfo, state| {
            if state.ro > 0 {
                return Err(FxtError::Again);
            }
            if use_class {
                use_size_class(state, SizeClass::for_size(num_bytes), force_wrong_size_class)?;
            }
            state.reserved += num_bytes;
            sinfo.bytes_reserved += num_bytes;
            if delalloc {
                state.delalloc_bytes += num_bytes;
            }
            trace!(group = self.start, num_bytes, ram_bytes, "add_reserved_bytes");
            Ok(())
        })
    }

    /// Drop a reservation that will never become an extent item.
    pub fn free_reserved_bytes(&self, num_bytes: u64, delalloc: bool) {
        self.with_counters(|sinfo, state| {
            if state.ro > 0 {
                sinfo.bytes_readonly += num_bytes;
            }
            state.reserved = state.reserved.saturating_sub(num_bytes);
            sinfo.bytes_reserved = sinfo.bytes_reserved.saturating_sub(num_bytes);
            sinfo.max_extent_size = 0;
            if delalloc {
                state.delalloc_bytes = state.delalloc_bytes.saturating_sub(num_bytes);
            }
            reset_class_if_empty(state);
        });
    }

    /// A reserved range became an extent item.
    pub fn account_alloc(&self, num_bytes: u64) -> Result<()> {
        self.with_counters(|sinfo, state| {
            if state.reserved < num_bytes {
                return Err(FxtError::corruption(
                    self.start,
                    format!("reserved {} below allocated {num_bytes}", state.reserved),
                ));
            }
            state.reserved -= num_bytes;
            state.used += num_bytes;
            sinfo.bytes_reserved = sinfo.bytes_reserved.saturating_sub(num_bytes);
            sinfo.bytes_used += num_bytes;
            Ok(())
        })
    }

    /// An extent item was deleted; its bytes stay pinned until commit.
    pub fn account_free(&self, num_bytes: u64) -> Result<()> {
        self.with_counters(|sinfo, state| {
            if state.used < num_bytes {
                return Err(FxtError::corruption(
                    self.start,
                    format!("used {} below freed {num_bytes}", state.used),
                ));
            }
            state.used -= num_bytes;
            state.pinned += num_bytes;
            sinfo.bytes_used = sinfo.bytes_used.saturating_sub(num_bytes);
            sinfo.bytes_pinned += num_bytes;
            Ok(())
        })
    }

    /// Pin `num_bytes`, converting them from reserved when `reserved`.
    pub fn pin(&self, num_bytes: u64, reserved: bool) {
        self.with_counters(|sinfo, state| {
            state.pinned += num_bytes;
            sinfo.bytes_pinned += num_bytes;
            if reserved {
                state.reserved = state.reserved.saturating_sub(num_bytes);
                sinfo.bytes_reserved = sinfo.bytes_reserved.saturating_sub(num_bytes);
            }
        });
    }

    /// Release pinned bytes after commit.
    ///
    /// Returns whether the bytes went somewhere other than the free pool
    /// (read-only or zoned groups).
    pub fn unpin(&self, num_bytes: u64) -> bool {
        self.with_counters(|sinfo, state| {
            state.pinned = state.pinned.saturating_sub(num_bytes);
            sinfo.bytes_pinned = sinfo.bytes_pinned.saturating_sub(num_bytes);
            sinfo.max_extent_size = 0;
            let diverted = if state.ro > 0 {
                sinfo.bytes_readonly += num_bytes;
                true
            } else if self.zoned {
                sinfo.bytes_zone_unusable += num_bytes;
                true
            } else {
                false
            };
            reset_class_if_empty(state);
            diverted
        })
    }

    /// Make the group read-only; its unallocated bytes count as read-only.
    pub fn inc_readonly(&self) {
        self.with_counters(|sinfo, state| {
            if state.ro == 0 {
                let free = self
                    .length
                    .saturating_sub(state.used + state.reserved + state.pinned + state.bytes_super + state.zone_unusable);
                sinfo.bytes_readonly += free;
            }
            state.ro += 1;
            debug!(group = self.start, ro = state.ro, "block group read-only");
        });
    }

    pub fn dec_readonly(&self) {
        self.with_counters(|sinfo, state| {
            if state.ro == 0 {
                return;
            }
            state.ro -= 1;
            if state.ro == 0 {
                let free = self
                    .length
                    .saturating_sub(state.used + state.reserved + state.pinned + state.bytes_super + state.zone_unusable);
                sinfo.bytes_readonly = sinfo.bytes_readonly.saturating_sub(free);
            }
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> BlockGroupSnapshot {
        let state = self.state.lock();
        BlockGroupSnapshot {
            start: self.start,
            length: self.length,
            flags: self.flags,
            used: state.used,
            reserved: state.reserved,
            pinned: state.pinned,
            bytes_super: state.bytes_super,
            zone_unusable: state.zone_unusable,
            free: if self.zoned {
                state.zone_free
            } else {
                state.free_space.free_space()
            },
            readonly: state.ro > 0,
            size_class: state.size_class,
            cached: state.cached,
        }
    }
}

/// Claim `class` for the group. An unclassed group adopts it; a group of a
/// different class refuses unless forced.
fn use_size_class(state: &mut BlockGroupState, class: SizeClass, force: bool) -> Result<()> {
    if state.size_class == class {
        return Ok(());
    }
    if state.size_class != SizeClass::None {
        return if force { Ok(()) } else { Err(FxtError::Again) };
    }
    state.size_class = class;
    Ok(())
}

fn reset_class_if_empty(state: &mut BlockGroupState) {
    if state.used == 0 && state.reserved == 0 && state.pinned == 0 {
        state.size_class = SizeClass::None;
    }
}

/// Zoned groups never reuse space behind the write pointer: bytes returned
/// below it become unusable until the zone is reset.
fn zoned_add_free(
    state: &mut BlockGroupState,
    group_start: u64,
    group_len: u64,
    start: u64,
    len: u64,
    zoned: bool,
) {
    debug_assert!(zoned);
    let offset = start.saturating_sub(group_start);
    let initial = len == group_len && state.alloc_offset == 0;
    let to_free = if initial {
        state.zone_capacity
    } else if offset >= state.alloc_offset {
        len
    } else if offset + len <= state.alloc_offset {
        0
    } else {
        offset + len - state.alloc_offset
    };
    let to_unusable = len.saturating_sub(to_free);
    state.zone_free += to_free;
    if state.ro == 0 {
        state.zone_unusable += to_unusable;
    }
}
