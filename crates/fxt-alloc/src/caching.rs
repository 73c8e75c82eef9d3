//! Loading a group's free space from the extent tree.
//!
//! A group created from an existing chunk starts with nothing in its
//! free-space index. Caching walks the extent items inside the group in key
//! order and records every gap between them as free, minus superblock copies
//! and ranges pinned by the running transaction.
//!
//! Caching runs in batches. Starting it only flips the state; whoever needs
//! the space (an allocator waiting on progress, or a background worker) runs
//! the batches. A group that is being cached can already serve allocations
//! from the part below its progress cursor. Cancellation is checked before
//! each batch, so a cancelled caller leaves the group at a batch boundary
//! with its progress cursor intact.

use crate::block_group::{BlockGroup, CacheState, SizeClass};
use crate::pin::PinTracker;
use asupersync::Cx;
use fxt_block::Chunk;
use fxt_btree::ItemStore;
use fxt_error::{FxtError, Result};
use fxt_types::{
    BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, BTRFS_SUPER_MIRROR_MAX, BtrfsKey,
    EXTENT_ITEM_KEY, METADATA_ITEM_KEY, PhysRange, super_mirror_offset,
};
use tracing::{debug, trace, warn};

/// Extent items scanned per batch.
pub const CACHING_BATCH_ITEMS: usize = 256;

/// Logical ranges of `chunk` that hold superblock copies on some stripe,
/// plus everything below the primary superblock.
#[must_use]
pub fn super_stripes(chunk: &Chunk) -> Vec<PhysRange> {
    let group = chunk.range();
    let mut ranges = Vec::new();
    if chunk.logical < BTRFS_SUPER_INFO_OFFSET {
        ranges.push(PhysRange::new(chunk.logical, BTRFS_SUPER_INFO_OFFSET - chunk.logical));
    }
    for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
        let sb = super_mirror_offset(mirror);
        for stripe in &chunk.stripes {
            let phys = PhysRange::new(stripe.physical, chunk.length);
            if !phys.contains(sb) {
                continue;
            }
            let logical = PhysRange::new(chunk.logical + (sb - stripe.physical), BTRFS_SUPER_INFO_SIZE);
            if let Some(clipped) = logical.intersect(group) {
                ranges.push(clipped);
            }
        }
    }
    normalize(ranges)
}

/// Sort and merge overlapping ranges.
fn normalize(mut ranges: Vec<PhysRange>) -> Vec<PhysRange> {
    ranges.sort_by_key(|r| r.start);
    let mut out: Vec<PhysRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = out.last_mut() {
            if range.start <= last.end() {
                let end = last.end().max(range.end());
                last.len = end - last.start;
                continue;
            }
        }
        out.push(range);
    }
    out
}

/// `gap` with every range in `excluded` (sorted, disjoint) cut out.
fn subtract(gap: PhysRange, excluded: &[PhysRange]) -> Vec<PhysRange> {
    let mut pieces = Vec::new();
    let mut cursor = gap.start;
    for ex in excluded {
        if ex.end() <= cursor || ex.start >= gap.end() {
            continue;
        }
        if ex.start > cursor {
            pieces.push(PhysRange::new(cursor, ex.start - cursor));
        }
        cursor = cursor.max(ex.end());
    }
    if cursor < gap.end() {
        pieces.push(PhysRange::new(cursor, gap.end() - cursor));
    }
    pieces
}

fn caching_failed(bg: &BlockGroup) -> FxtError {
    FxtError::Io(std::io::Error::other(format!(
        "free space caching failed for block group {}",
        bg.start()
    )))
}

/// What a caching pass reads from and must respect.
#[derive(Clone, Copy)]
pub struct Caching<'a> {
    pub store: &'a dyn ItemStore,
    pub pins: &'a PinTracker,
    pub batch_items: usize,
    pub size_classes: bool,
}

impl std::fmt::Debug for Caching<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caching")
            .field("batch_items", &self.batch_items)
            .field("size_classes", &self.size_classes)
            .finish_non_exhaustive()
    }
}

impl Caching<'_> {
    /// Mark `bg` as being cached. Returns whether this call started it.
    pub fn start(&self, bg: &BlockGroup) -> bool {
        let mut state = bg.lock();
        if state.cached != CacheState::NotStarted {
            return false;
        }
        state.cached = CacheState::Started;
        debug!(group = bg.start(), "caching started");
        true
    }

    /// Scan the next batch. Returns `true` once the group is fully cached.
    pub fn run_batch(&self, cx: &Cx, bg: &BlockGroup) -> Result<bool> {
        let progress = {
            let mut state = bg.lock();
            match state.cached {
                CacheState::Finished => return Ok(true),
                CacheState::Error => return Err(caching_failed(bg)),
                CacheState::NotStarted => state.cached = CacheState::Started,
                CacheState::Started => {}
            }
            state.caching_progress
        };
        cx.checkpoint().map_err(|_| FxtError::Cancelled)?;
        let end = bg.end();
        let items = match self.store.items_in(
            &BtrfsKey::new(progress, 0, 0),
            &BtrfsKey::new(end.saturating_sub(1), u8::MAX, u64::MAX),
        ) {
            Ok(items) => items,
            Err(err) => {
                bg.lock().cached = CacheState::Error;
                warn!(group = bg.start(), error = %err, "failed to cache block group");
                return Err(err);
            }
        };

        let nodesize = u64::from(self.store.nodesize());
        let mut cursor = progress;
        let mut seen = 0_usize;
        let mut min_extent = 0_u64;
        let mut gaps = Vec::new();
        let mut finished = true;
        for (key, _) in &items {
            let len = match key.item_type {
                EXTENT_ITEM_KEY => key.offset,
                METADATA_ITEM_KEY => nodesize,
                _ => continue,
            };
            if key.objectid < cursor {
                continue;
            }
            if seen == self.batch_items.max(1) {
                finished = false;
                break;
            }
            if key.objectid > cursor {
                gaps.push(PhysRange::new(cursor, key.objectid - cursor));
            }
            cursor = key.objectid.saturating_add(len).min(end);
            seen += 1;
            if key.item_type == EXTENT_ITEM_KEY {
                min_extent = if min_extent == 0 { len } else { min_extent.min(len) };
            }
        }
        if finished {
            if cursor < end {
                gaps.push(PhysRange::new(cursor, end - cursor));
            }
            cursor = end;
        }

        let pinned = self.pins.pinned_in(progress, cursor);
        let use_class = bg.should_use_size_class(self.size_classes);
        let mut state = bg.lock();
        if state.caching_progress != progress || state.cached != CacheState::Started {
            // Another waiter ran this batch.
            return Ok(state.cached == CacheState::Finished);
        }
        let mut excluded = state.super_stripes.clone();
        excluded.extend(pinned);
        let excluded = normalize(excluded);
        let mut added = 0_u64;
        for gap in gaps {
            for piece in subtract(gap, &excluded) {
                state.free_space.add_free_space(piece.start, piece.len)?;
                added += piece.len;
            }
        }
        state.caching_progress = cursor;
        if min_extent != 0 {
            state.caching_min_extent = if state.caching_min_extent == 0 {
                min_extent
            } else {
                state.caching_min_extent.min(min_extent)
            };
        }
        trace!(group = bg.start(), progress = cursor, added, "caching batch");
        if finished {
            state.cached = CacheState::Finished;
            if use_class && state.size_class == SizeClass::None && state.caching_min_extent != 0 {
                state.size_class = SizeClass::for_size(state.caching_min_extent);
            }
            debug!(
                group = bg.start(),
                free = state.free_space.free_space(),
                size_class = ?state.size_class,
                "caching finished"
            );
        }
        Ok(finished)
    }

    /// Run batches until `bg` has at least `num_bytes` free or is done.
    pub fn wait_progress(&self, cx: &Cx, bg: &BlockGroup, num_bytes: u64) -> Result<()> {
        loop {
            {
                let state = bg.lock();
                match state.cached {
                    CacheState::Finished => return Ok(()),
                    CacheState::Error => return Err(caching_failed(bg)),
                    _ if state.free_space.free_space() >= num_bytes => return Ok(()),
                    _ => {}
                }
            }
            if self.run_batch(cx, bg)? {
                return Ok(());
            }
        }
    }

    /// Run batches until `bg` is fully cached.
    pub fn wait_done(&self, cx: &Cx, bg: &BlockGroup) -> Result<()> {
        while !self.run_batch(cx, bg)? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space_info::{SpaceInfo, SubGroup};
    use fxt_block::Stripe;
    use fxt_btree::MemItemStore;
    use fxt_types::{BlockGroupFlags, DeviceId, SZ_1M};
    use std::sync::Arc;

    fn group(start: u64, len: u64) -> BlockGroup {
        let sinfo = Arc::new(SpaceInfo::new(BlockGroupFlags::DATA, SubGroup::Primary));
        BlockGroup::new(start, len, BlockGroupFlags::DATA, sinfo, 4096, false, Vec::new())
    }

    fn extent(store: &MemItemStore, bytenr: u64, len: u64) {
        store
            .insert_item(BtrfsKey::new(bytenr, EXTENT_ITEM_KEY, len), &[0; 24])
            .expect("insert");
    }

    #[test]
    fn super_stripes_map_mirror_offsets() {
        let chunk = Chunk {
            logical: SZ_1M * 100,
            length: SZ_1M * 64,
            flags: BlockGroupFlags::DATA,
            stripes: vec![Stripe {
                devid: DeviceId(1),
                physical: SZ_1M * 32,
            }],
        };
        assert_eq!(
            super_stripes(&chunk),
            vec![PhysRange::new(SZ_1M * 132, BTRFS_SUPER_INFO_SIZE)]
        );

        let low = Chunk {
            logical: 0,
            length: SZ_1M,
            flags: BlockGroupFlags::SYSTEM,
            stripes: vec![Stripe {
                devid: DeviceId(1),
                physical: 0,
            }],
        };
        assert_eq!(
            super_stripes(&low),
            vec![PhysRange::new(0, BTRFS_SUPER_INFO_OFFSET + BTRFS_SUPER_INFO_SIZE)]
        );
    }

    #[test]
    fn gaps_between_extents_become_free() {
        let store = MemItemStore::new(16_384);
        let pins = PinTracker::new();
        let bg = group(SZ_1M, SZ_1M);
        extent(&store, SZ_1M, 65_536);
        extent(&store, SZ_1M + 131_072, 65_536);
        store
            .insert_item(BtrfsKey::new(SZ_1M + 262_144, METADATA_ITEM_KEY, 0), &[0; 24])
            .expect("metadata");
        let caching = Caching {
            store: &store,
            pins: &pins,
            batch_items: 1,
            size_classes: true,
        };
        assert!(caching.start(&bg));
        assert!(!caching.start(&bg));
        caching.wait_done(&Cx::for_testing(), &bg).expect("cache");
        let free: Vec<_> = bg.lock().free_space.iter().collect();
        assert_eq!(
            free,
            vec![
                PhysRange::new(SZ_1M + 65_536, 65_536),
                PhysRange::new(SZ_1M + 196_608, 65_536),
                PhysRange::new(SZ_1M + 262_144 + 16_384, SZ_1M - 262_144 - 16_384),
            ]
        );
        assert_eq!(bg.lock().size_class, SizeClass::Small);
    }

    #[test]
    fn pinned_ranges_are_not_cached() {
        let store = MemItemStore::new(16_384);
        let pins = PinTracker::new();
        pins.pin(SZ_1M + 4096, 4096);
        let bg = group(SZ_1M, SZ_1M);
        let caching = Caching {
            store: &store,
            pins: &pins,
            batch_items: CACHING_BATCH_ITEMS,
            size_classes: false,
        };
        caching.wait_done(&Cx::for_testing(), &bg).expect("cache");
        assert_eq!(bg.free_bytes(), SZ_1M - 4096);
        assert!(!bg.lock().free_space.overlaps_free(PhysRange::new(SZ_1M + 4096, 4096)));
    }

    #[test]
    fn wait_progress_stops_early() {
        let store = MemItemStore::new(16_384);
        let pins = PinTracker::new();
        let bg = group(0, SZ_1M * 4);
        for i in 0..4 {
            extent(&store, i * SZ_1M + 4096, 4096);
        }
        let caching = Caching {
            store: &store,
            pins: &pins,
            batch_items: 1,
            size_classes: false,
        };
        caching
            .wait_progress(&Cx::for_testing(), &bg, 4096)
            .expect("progress");
        let state = bg.lock();
        assert_eq!(state.cached, CacheState::Started);
        assert_eq!(state.caching_progress, 8192);
    }

    #[test]
    fn read_failure_marks_group() {
        let store = MemItemStore::new(16_384);
        let pins = PinTracker::new();
        let bg = group(0, SZ_1M);
        store.fail_reads_with(Some(5));
        let caching = Caching {
            store: &store,
            pins: &pins,
            batch_items: 8,
            size_classes: false,
        };
        let cx = Cx::for_testing();
        assert!(caching.wait_done(&cx, &bg).is_err());
        assert_eq!(bg.lock().cached, CacheState::Error);
        store.fail_reads_with(None);
        assert!(matches!(caching.run_batch(&cx, &bg), Err(FxtError::Io(_))));
    }

    #[test]
    fn cancelled_caching_stops_at_a_batch_boundary() {
        let store = MemItemStore::new(16_384);
        let pins = PinTracker::new();
        let bg = group(0, SZ_1M * 4);
        for i in 0..4 {
            extent(&store, i * SZ_1M + 4096, 4096);
        }
        let caching = Caching {
            store: &store,
            pins: &pins,
            batch_items: 1,
            size_classes: false,
        };
        let cx = Cx::for_testing();
        assert!(!caching.run_batch(&cx, &bg).expect("first batch"));
        let progress = bg.lock().caching_progress;

        cx.set_cancel_requested(true);
        assert!(matches!(caching.wait_done(&cx, &bg), Err(FxtError::Cancelled)));
        {
            let state = bg.lock();
            assert_eq!(state.cached, CacheState::Started);
            assert_eq!(state.caching_progress, progress);
        }

        caching.wait_done(&Cx::for_testing(), &bg).expect("resume");
        assert_eq!(bg.lock().cached, CacheState::Finished);
        assert_eq!(bg.free_bytes(), SZ_1M * 4 - 4 * 4096);
    }
}
