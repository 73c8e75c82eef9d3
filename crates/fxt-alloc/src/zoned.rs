//! Sequential-write groups.
//!
//! A zoned group hands out space only at its write pointer. Freed bytes
//! below the pointer are unusable until the whole zone is reset, which is
//! only possible once nothing in the group is used, reserved or pinned.

use crate::allocator::{FfeCtl, FsAlloc};
use crate::block_group::{BlockGroup, BlockGroupState, CacheState};
use asupersync::Cx;
use fxt_btree::ItemStore;
use fxt_error::{FxtError, Result};
use fxt_types::{BtrfsKey, EXTENT_ITEM_KEY, METADATA_ITEM_KEY};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, trace};

#[derive(Debug, Default, Clone, Copy)]
struct Dedicated {
    treelog: Option<u64>,
    data_reloc: Option<u64>,
}

/// The groups reserved for tree-log and data-relocation allocations.
#[derive(Debug, Default)]
pub struct DedicatedGroups {
    inner: Mutex<Dedicated>,
}

impl DedicatedGroups {
    #[must_use]
    pub fn treelog(&self) -> Option<u64> {
        self.inner.lock().treelog
    }

    #[must_use]
    pub fn data_reloc(&self) -> Option<u64> {
        self.inner.lock().data_reloc
    }

    /// Start tree-log and relocation searches at their dedicated group.
    pub(crate) fn prepare_hint(&self, ctl: &mut FfeCtl) {
        let inner = self.inner.lock();
        let dedicated = if ctl.for_treelog {
            inner.treelog
        } else if ctl.for_data_reloc {
            inner.data_reloc
        } else {
            None
        };
        if let Some(start) = dedicated {
            ctl.hint_byte = start;
        }
    }

    pub(crate) fn clear_data_reloc(&self, group_start: u64) {
        let mut inner = self.inner.lock();
        if inner.data_reloc == Some(group_start) {
            inner.data_reloc = None;
        }
    }

    fn clear_group(&self, group_start: u64) {
        let mut inner = self.inner.lock();
        if inner.treelog == Some(group_start) {
            inner.treelog = None;
        }
        if inner.data_reloc == Some(group_start) {
            inner.data_reloc = None;
        }
    }

    /// A new chunk cannot serve a tree-log or relocation request once a
    /// dedicated group for it exists.
    pub(crate) fn can_allocate_chunk(&self, zoned: bool, ctl: &FfeCtl) -> bool {
        if !zoned {
            return true;
        }
        let inner = self.inner.lock();
        !(ctl.for_treelog && inner.treelog.is_some() || ctl.for_data_reloc && inner.data_reloc.is_some())
    }

    /// Bump-allocate `ctl.num_bytes` at `bg`'s write pointer.
    ///
    /// Sets `ctl.found_offset` and returns `true` on success.
    pub(crate) fn do_allocation_zoned(&self, bg: &Arc<BlockGroup>, ctl: &mut FfeCtl) -> bool {
        {
            let inner = self.inner.lock();
            let wrong_log = inner
                .treelog
                .is_some_and(|log| (ctl.for_treelog && bg.start() != log) || (!ctl.for_treelog && bg.start() == log));
            let wrong_reloc = inner.data_reloc.is_some_and(|reloc| {
                (ctl.for_data_reloc && bg.start() != reloc) || (!ctl.for_data_reloc && bg.start() == reloc)
            });
            if wrong_log || wrong_reloc {
                return false;
            }
        }

        let sinfo = bg.space_info();
        let _space = sinfo.lock();
        let mut state = bg.lock();
        let mut inner = self.inner.lock();
        let ok = bump(&mut inner, &mut state, bg, ctl);
        if !ok {
            if ctl.for_treelog {
                inner.treelog = None;
            }
            if ctl.for_data_reloc {
                inner.data_reloc = None;
            }
        }
        ok
    }
}

fn bump(inner: &mut Dedicated, state: &mut BlockGroupState, bg: &BlockGroup, ctl: &mut FfeCtl) -> bool {
    if state.ro > 0 || state.alloc_offset >= state.zone_capacity {
        return false;
    }
    let busy = state.used > 0 || state.reserved > 0;
    if ctl.for_treelog && inner.treelog.is_none() && busy {
        return false;
    }
    if ctl.for_data_reloc && inner.data_reloc.is_none() && busy {
        return false;
    }
    let avail = state.zone_capacity - state.alloc_offset;
    if avail < ctl.num_bytes {
        if ctl.max_extent_size < avail {
            // Free space in a zone is always one extent.
            ctl.max_extent_size = avail;
            ctl.total_free_space = avail;
        }
        return false;
    }
    if ctl.for_treelog && inner.treelog.is_none() {
        inner.treelog = Some(bg.start());
        info!(group = bg.start(), "dedicated tree-log group");
    }
    if ctl.for_data_reloc {
        if inner.data_reloc.is_none() {
            inner.data_reloc = Some(bg.start());
            info!(group = bg.start(), "dedicated relocation group");
        }
        state.zoned_data_reloc = true;
    }
    ctl.found_offset = bg.start() + state.alloc_offset;
    state.alloc_offset += ctl.num_bytes;
    state.zone_free = state.zone_free.saturating_sub(ctl.num_bytes);
    ctl.search_start = ctl.found_offset;
    trace!(group = bg.start(), offset = ctl.found_offset, "zoned bump allocation");
    true
}

/// Rebuild the write pointer of an existing zoned group from its last
/// extent item.
pub(crate) fn load_zone_info(bg: &BlockGroup, store: &dyn ItemStore) -> Result<()> {
    let items = store.items_in(
        &BtrfsKey::new(bg.start(), 0, 0),
        &BtrfsKey::new(bg.end().saturating_sub(1), u8::MAX, u64::MAX),
    )?;
    let nodesize = u64::from(store.nodesize());
    let write_pointer = items
        .iter()
        .filter_map(|(key, _)| match key.item_type {
            EXTENT_ITEM_KEY => Some(key.objectid.saturating_add(key.offset)),
            METADATA_ITEM_KEY => Some(key.objectid.saturating_add(nodesize)),
            _ => None,
        })
        .max()
        .unwrap_or(bg.start())
        .min(bg.end());

    let mut sinfo = bg.space_info().lock();
    let mut state = bg.lock();
    let alloc_offset = write_pointer - bg.start();
    if alloc_offset < state.used {
        return Err(FxtError::corruption(
            bg.start(),
            format!("write pointer {alloc_offset} below used {}", state.used),
        ));
    }
    state.alloc_offset = alloc_offset;
    state.zone_free = state.zone_capacity.saturating_sub(alloc_offset);
    state.zone_unusable = alloc_offset - state.used;
    sinfo.counters.bytes_zone_unusable += state.zone_unusable;
    state.cached = CacheState::Finished;
    state.caching_progress = bg.end();
    debug!(
        group = bg.start(),
        alloc_offset,
        zone_unusable = state.zone_unusable,
        "zone info loaded"
    );
    Ok(())
}

impl FsAlloc {
    #[must_use]
    pub fn dedicated_treelog_group(&self) -> Option<u64> {
        self.dedicated.treelog()
    }

    #[must_use]
    pub fn dedicated_data_reloc_group(&self) -> Option<u64> {
        self.dedicated.data_reloc()
    }

    /// Reset the zone behind an idle group and make all of it allocatable
    /// again.
    ///
    /// Fails with `Busy` while any byte is used, reserved or pinned.
    pub fn reclaim_zoned_group(&self, cx: &Cx, group_start: u64) -> Result<u64> {
        let bg = self
            .block_group(group_start)
            .filter(|bg| bg.start() == group_start)
            .ok_or_else(|| FxtError::NotFound(format!("block group at {group_start}")))?;
        if !bg.is_zoned() {
            return Err(FxtError::InvalidArgument(format!(
                "block group {group_start} is not zoned"
            )));
        }
        {
            let state = bg.lock();
            if state.used > 0 || state.reserved > 0 || state.pinned > 0 {
                return Err(FxtError::Busy);
            }
        }
        self.volumes.zone_reset_logical(cx, bg.start(), bg.length())?;

        let mut sinfo = bg.space_info().lock();
        let mut state = bg.lock();
        let reclaimed = state.zone_unusable;
        sinfo.counters.bytes_zone_unusable = sinfo.counters.bytes_zone_unusable.saturating_sub(reclaimed);
        sinfo.counters.max_extent_size = 0;
        state.alloc_offset = 0;
        state.zone_unusable = 0;
        state.zone_free = state.zone_capacity;
        state.zoned_data_reloc = false;
        drop(state);
        drop(sinfo);
        self.dedicated.clear_group(group_start);
        info!(group = group_start, reclaimed, "zoned block group reset");
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use crate::allocator::{AllocConfig, AllocRequest, FsAlloc};
    use asupersync::Cx;
    use fxt_block::{BlockDevice, DeviceCommand, MemBlockDevice, Volumes};
    use fxt_btree::{ItemStore, MemItemStore};
    use fxt_error::FxtError;
    use fxt_types::SZ_1M;
    use std::sync::Arc;

    const ZONE: u64 = SZ_1M * 8;

    fn zoned_fs() -> (FsAlloc, Arc<MemBlockDevice>) {
        let config = AllocConfig {
            zoned: true,
            zone_size: ZONE,
            data_chunk_size: SZ_1M * 64,
            metadata_chunk_size: SZ_1M * 64,
            ..AllocConfig::default()
        };
        let volumes = Arc::new(Volumes::new(SZ_1M * 16));
        let dev = Arc::new(MemBlockDevice::new(1, SZ_1M * 256).zoned(ZONE));
        volumes
            .add_device(Arc::clone(&dev) as Arc<dyn BlockDevice>)
            .expect("device");
        let store: Arc<dyn ItemStore> = Arc::new(MemItemStore::new(16_384));
        (FsAlloc::new(config, volumes, store), dev)
    }

    #[test]
    fn allocations_follow_the_write_pointer() {
        let cx = Cx::for_testing();
        let (alloc, _) = zoned_fs();
        let a = alloc.find_free_extent(&cx, &AllocRequest::data(65_536)).expect("a");
        let bg = alloc.block_group(a.start).expect("group");
        assert_eq!(bg.length(), ZONE);
        assert_eq!(a.start, bg.start());
        let b = alloc.find_free_extent(&cx, &AllocRequest::data(4096)).expect("b");
        assert_eq!(b.start, a.start + 65_536);
        assert_eq!(bg.lock().alloc_offset, 69_632);
        assert_eq!(bg.free_bytes(), ZONE - 69_632);
    }

    #[test]
    fn freed_bytes_become_unusable_until_reset() {
        let cx = Cx::for_testing();
        let (alloc, dev) = zoned_fs();
        let a = alloc.find_free_extent(&cx, &AllocRequest::data(SZ_1M)).expect("a");
        let start = alloc.block_group(a.start).expect("group").start();
        alloc.update_block_group(a.start, a.len, true).expect("used");
        alloc.update_block_group(a.start, a.len, false).expect("freed");
        assert!(matches!(alloc.reclaim_zoned_group(&cx, start), Err(FxtError::Busy)));
        alloc.finish_extent_commit(&cx).expect("commit");

        let bg = alloc.block_group(start).expect("group");
        assert_eq!(bg.lock().zone_unusable, SZ_1M);
        assert_eq!(bg.space_info().counters().bytes_zone_unusable, SZ_1M);
        assert!(!alloc.contains_free(a.range()));

        assert_eq!(alloc.reclaim_zoned_group(&cx, start).expect("reset"), SZ_1M);
        assert_eq!(bg.lock().alloc_offset, 0);
        assert_eq!(bg.space_info().counters().bytes_zone_unusable, 0);
        assert!(alloc.contains_free(a.range()));
        assert!(
            dev.commands()
                .iter()
                .any(|cmd| matches!(cmd, DeviceCommand::ZoneReset { len, .. } if *len == ZONE))
        );
    }

    #[test]
    fn treelog_gets_a_dedicated_group() {
        let cx = Cx::for_testing();
        let (alloc, _) = zoned_fs();
        let regular = alloc
            .find_free_extent(&cx, &AllocRequest::metadata(16_384))
            .expect("regular");
        let log_req = AllocRequest {
            for_treelog: true,
            ..AllocRequest::metadata(16_384)
        };
        let log = alloc.find_free_extent(&cx, &log_req).expect("treelog");
        let log_group = alloc.dedicated_treelog_group().expect("dedicated");
        assert!(alloc.block_group(log.start).expect("group").start() == log_group);
        assert!(!alloc.block_group(regular.start).expect("group").range().contains(log.start));

        let next = alloc
            .find_free_extent(&cx, &AllocRequest::metadata(16_384))
            .expect("regular again");
        assert!(!alloc.block_group(log_group).expect("group").range().contains(next.start));
        let log2 = alloc.find_free_extent(&cx, &log_req).expect("treelog again");
        assert_eq!(log2.start, log.start + 16_384);
    }

    #[test]
    fn full_zone_moves_to_a_new_zone() {
        let cx = Cx::for_testing();
        let (alloc, _) = zoned_fs();
        let fill = alloc
            .find_free_extent(&cx, &AllocRequest::data(ZONE - SZ_1M))
            .expect("fill");
        let first = alloc.block_group(fill.start).expect("group");
        let next = alloc
            .find_free_extent(&cx, &AllocRequest::data(SZ_1M * 4))
            .expect("second zone");
        assert!(!first.range().contains(next.start));
        assert_eq!(next.phases.last(), Some(&crate::LoopPhase::AllocChunk));
        assert_eq!(first.free_bytes(), SZ_1M);
    }
}
