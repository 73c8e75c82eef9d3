//! Filesystem-wide allocator state and the extent search.
//!
//! [`FsAlloc::find_free_extent`] walks the block groups of one space info in
//! raid-index order. Each pass over the groups runs under a [`LoopPhase`];
//! when a pass finds nothing the phase advances, relaxing one constraint at a
//! time until a range is found or every phase is exhausted.

use crate::block_group::{BlockGroup, BlockGroupSnapshot, CacheState, SizeClass};
use crate::caching::{CACHING_BATCH_ITEMS, Caching, super_stripes};
use crate::cluster::{ClusterPolicy, ClusterState, FreeCluster};
use crate::pin::PinTracker;
use crate::space_info::{SpaceCounters, SpaceInfo, SubGroup};
use crate::zoned::DedicatedGroups;
use asupersync::Cx;
use fxt_block::{Chunk, Volumes};
use fxt_btree::ItemStore;
use fxt_error::{FxtError, Result};
use fxt_types::{
    BlockGroupFlags, PhysRange, RaidProfile, SZ_1G, SZ_2M, SZ_32M, SZ_64K, SZ_256M, align_down,
    align_up,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| FxtError::Cancelled)
}

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    pub sectorsize: u64,
    pub nodesize: u32,
    pub ssd: bool,
    pub ssd_spread: bool,
    pub zoned: bool,
    /// Zone size of the devices; caps chunk sizes on zoned filesystems.
    pub zone_size: u64,
    pub size_classes: bool,
    /// Discard freed ranges at commit, before they return to the free pool.
    pub discard_sync: bool,
    pub max_discard_chunk_size: u64,
    pub data_chunk_size: u64,
    pub metadata_chunk_size: u64,
    pub system_chunk_size: u64,
    pub caching_batch_items: usize,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            sectorsize: 4096,
            nodesize: 16_384,
            ssd: false,
            ssd_spread: false,
            zoned: false,
            zone_size: 0,
            size_classes: true,
            discard_sync: false,
            max_discard_chunk_size: SZ_1G,
            data_chunk_size: SZ_1G,
            metadata_chunk_size: SZ_256M,
            system_chunk_size: SZ_32M,
            caching_batch_items: CACHING_BATCH_ITEMS,
        }
    }
}

// ── Requests ────────────────────────────────────────────────────────────────

/// Phases of the extent search, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// Only groups whose free space is already loaded; uncached groups
    /// start loading in the background.
    CachingNowait,
    /// Wait for loading groups to make progress.
    CachingWait,
    /// Groups that have not committed to a size class become eligible.
    UnsetSizeClass,
    /// Allocate a new chunk, then search again.
    AllocChunk,
    /// Size classes are ignored.
    WrongSizeClass,
    /// Drop the empty-size and cluster padding.
    NoEmptySize,
}

impl LoopPhase {
    fn next(self) -> Self {
        match self {
            Self::CachingNowait => Self::CachingWait,
            Self::CachingWait => Self::UnsetSizeClass,
            Self::UnsetSizeClass => Self::AllocChunk,
            Self::AllocChunk => Self::WrongSizeClass,
            Self::WrongSizeClass | Self::NoEmptySize => Self::NoEmptySize,
        }
    }
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CachingNowait => "caching_nowait",
            Self::CachingWait => "caching_wait",
            Self::UnsetSizeClass => "unset_size_class",
            Self::AllocChunk => "alloc_chunk",
            Self::WrongSizeClass => "wrong_size_class",
            Self::NoEmptySize => "no_empty_size",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRequest {
    pub ram_bytes: u64,
    pub num_bytes: u64,
    pub min_alloc_size: u64,
    /// Extra free bytes wanted after the range, to leave room for growth.
    pub empty_size: u64,
    pub hint_byte: u64,
    /// Type and profile bits of the group to allocate from.
    pub flags: BlockGroupFlags,
    pub delalloc: bool,
    pub for_treelog: bool,
    pub for_data_reloc: bool,
}

impl AllocRequest {
    /// A single-profile data request of exactly `num_bytes`.
    #[must_use]
    pub fn data(num_bytes: u64) -> Self {
        Self {
            ram_bytes: num_bytes,
            num_bytes,
            min_alloc_size: num_bytes,
            empty_size: 0,
            hint_byte: 0,
            flags: BlockGroupFlags::DATA,
            delalloc: false,
            for_treelog: false,
            for_data_reloc: false,
        }
    }

    /// A single-profile metadata request for one tree block.
    #[must_use]
    pub fn metadata(nodesize: u64) -> Self {
        Self {
            flags: BlockGroupFlags::METADATA,
            ..Self::data(nodesize)
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: BlockGroupFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint_byte: u64) -> Self {
        self.hint_byte = hint_byte;
        self
    }

    #[must_use]
    pub fn with_min_alloc(mut self, min_alloc_size: u64) -> Self {
        self.min_alloc_size = min_alloc_size;
        self
    }
}

/// A reserved range and the phases the search went through to find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundExtent {
    pub start: u64,
    pub len: u64,
    pub phases: Vec<LoopPhase>,
}

impl FoundExtent {
    #[must_use]
    pub fn range(&self) -> PhysRange {
        PhysRange::new(self.start, self.len)
    }
}

// ── Search state ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct FfeCtl {
    pub ram_bytes: u64,
    pub num_bytes: u64,
    pub empty_size: u64,
    pub empty_cluster: u64,
    pub flags: BlockGroupFlags,
    pub delalloc: bool,
    pub for_treelog: bool,
    pub for_data_reloc: bool,
    pub size_class: SizeClass,

    pub phase: LoopPhase,
    pub index: usize,
    pub full_search: bool,
    pub have_caching_bg: bool,
    pub orig_have_caching_bg: bool,
    pub retry_uncached: bool,
    pub cached: bool,
    pub use_cluster: bool,

    pub search_start: u64,
    pub hint_byte: u64,
    pub found_offset: u64,
    pub max_extent_size: u64,
    pub total_free_space: u64,
    pub cache_error: Option<FxtError>,
    pub phases: Vec<LoopPhase>,
}

impl FfeCtl {
    fn new(req: &AllocRequest) -> Self {
        Self {
            ram_bytes: req.ram_bytes,
            num_bytes: req.num_bytes,
            empty_size: req.empty_size,
            empty_cluster: 0,
            flags: req.flags,
            delalloc: req.delalloc,
            for_treelog: req.for_treelog,
            for_data_reloc: req.for_data_reloc,
            size_class: SizeClass::for_size(req.num_bytes),
            phase: LoopPhase::CachingNowait,
            index: req.flags.profile().raid_index(),
            full_search: false,
            have_caching_bg: false,
            orig_have_caching_bg: false,
            retry_uncached: false,
            cached: false,
            use_cluster: true,
            search_start: 0,
            hint_byte: req.hint_byte,
            found_offset: 0,
            max_extent_size: 0,
            total_free_space: 0,
            cache_error: None,
            phases: vec![LoopPhase::CachingNowait],
        }
    }

    fn advance_phase(&mut self) {
        self.phase = self.phase.next();
        self.phases.push(self.phase);
    }

    fn note_max_extent(&mut self, len: u64) {
        self.max_extent_size = self.max_extent_size.max(len);
    }
}

enum ClusterOutcome {
    Found(Arc<BlockGroup>),
    NextGroup,
    Unclustered,
}

// ── Snapshots ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfoSnapshot {
    pub flags: BlockGroupFlags,
    pub subgroup: SubGroup,
    pub counters: SpaceCounters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocSnapshot {
    pub space_infos: Vec<SpaceInfoSnapshot>,
    pub groups: Vec<BlockGroupSnapshot>,
    pub pinned: Vec<PhysRange>,
    pub stranded: Vec<PhysRange>,
}

// ── Filesystem allocator ────────────────────────────────────────────────────

/// Every block group, space info and cluster of one filesystem.
pub struct FsAlloc {
    pub(crate) config: AllocConfig,
    pub(crate) volumes: Arc<Volumes>,
    pub(crate) store: Arc<dyn ItemStore>,
    pub(crate) groups: RwLock<BTreeMap<u64, Arc<BlockGroup>>>,
    space_infos: RwLock<Vec<Arc<SpaceInfo>>>,
    meta_cluster: FreeCluster,
    data_cluster: FreeCluster,
    pub(crate) dedicated: DedicatedGroups,
    pub(crate) pins: PinTracker,
}

impl fmt::Debug for FsAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsAlloc")
            .field("config", &self.config)
            .field("groups", &self.groups.read().len())
            .field("space_infos", &self.space_infos.read().len())
            .finish_non_exhaustive()
    }
}

impl FsAlloc {
    #[must_use]
    pub fn new(config: AllocConfig, volumes: Arc<Volumes>, store: Arc<dyn ItemStore>) -> Self {
        Self {
            config,
            volumes,
            store,
            groups: RwLock::new(BTreeMap::new()),
            space_infos: RwLock::new(Vec::new()),
            meta_cluster: FreeCluster::new(),
            data_cluster: FreeCluster::new(),
            dedicated: DedicatedGroups::default(),
            pins: PinTracker::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    #[must_use]
    pub fn volumes(&self) -> &Arc<Volumes> {
        &self.volumes
    }

    #[must_use]
    pub fn pins(&self) -> &PinTracker {
        &self.pins
    }

    pub(crate) fn caching(&self) -> Caching<'_> {
        Caching {
            store: self.store.as_ref(),
            pins: &self.pins,
            batch_items: self.config.caching_batch_items,
            size_classes: self.config.size_classes,
        }
    }

    // ── Space infos and groups ──────────────────────────────────────────────

    /// Space info for the type bits of `flags`, created on first use.
    pub fn space_info(&self, flags: BlockGroupFlags, subgroup: SubGroup) -> Arc<SpaceInfo> {
        let type_bits = flags.type_bits();
        let matches = |s: &&Arc<SpaceInfo>| s.flags() == type_bits && s.subgroup() == subgroup;
        if let Some(found) = self.space_infos.read().iter().find(matches) {
            return Arc::clone(found);
        }
        let mut infos = self.space_infos.write();
        if let Some(found) = infos.iter().find(matches) {
            return Arc::clone(found);
        }
        let created = Arc::new(SpaceInfo::new(type_bits, subgroup));
        infos.push(Arc::clone(&created));
        created
    }

    #[must_use]
    pub fn space_infos(&self) -> Vec<Arc<SpaceInfo>> {
        self.space_infos.read().clone()
    }

    /// Zoned filesystems keep tree-log and relocation allocations in their
    /// own space infos.
    fn resolve_space_info(&self, req: &AllocRequest) -> Arc<SpaceInfo> {
        let subgroup = if self.config.zoned && req.for_data_reloc {
            SubGroup::DataReloc
        } else if self.config.zoned && req.for_treelog {
            SubGroup::Treelog
        } else {
            SubGroup::Primary
        };
        self.space_info(req.flags, subgroup)
    }

    /// Group containing `bytenr`.
    #[must_use]
    pub fn block_group(&self, bytenr: u64) -> Option<Arc<BlockGroup>> {
        self.groups
            .read()
            .range(..=bytenr)
            .next_back()
            .map(|(_, bg)| bg)
            .filter(|bg| bg.range().contains(bytenr))
            .cloned()
    }

    fn block_group_at(&self, start: u64) -> Option<Arc<BlockGroup>> {
        self.groups.read().get(&start).cloned()
    }

    #[must_use]
    pub fn block_groups(&self) -> Vec<Arc<BlockGroup>> {
        self.groups.read().values().cloned().collect()
    }

    fn first_logical_byte(&self) -> u64 {
        self.groups.read().keys().next().copied().unwrap_or(0)
    }

    fn make_block_group(
        &self,
        chunk: &Chunk,
        sinfo: &Arc<SpaceInfo>,
        used: u64,
        fresh: bool,
    ) -> Result<Arc<BlockGroup>> {
        let stripes = if self.config.zoned {
            Vec::new()
        } else {
            super_stripes(chunk)
        };
        let bg = Arc::new(BlockGroup::new(
            chunk.logical,
            chunk.length,
            chunk.flags,
            Arc::clone(sinfo),
            self.config.sectorsize,
            self.config.zoned,
            stripes,
        ));
        {
            let mut groups = self.groups.write();
            if groups.contains_key(&chunk.logical) {
                return Err(FxtError::Exists(format!("block group at {}", chunk.logical)));
            }
            groups.insert(chunk.logical, Arc::clone(&bg));
        }
        let bytes_super = bg.lock().bytes_super;
        sinfo.link_group(bg.start(), bg.flags(), bg.length(), bytes_super);
        if used > 0 {
            let mut sstate = sinfo.lock();
            sstate.counters.bytes_used += used;
            bg.lock().used = used;
        }
        if fresh {
            bg.init_empty()?;
        } else if self.config.zoned {
            crate::zoned::load_zone_info(&bg, self.store.as_ref())?;
        }
        debug!(
            group = bg.start(),
            length = bg.length(),
            flags = %bg.flags(),
            used,
            fresh,
            "block group added"
        );
        Ok(bg)
    }

    /// Register an existing chunk holding `used` bytes of extents. Its free
    /// space is loaded lazily from the extent tree.
    pub fn add_block_group(&self, chunk: Chunk, used: u64) -> Result<Arc<BlockGroup>> {
        self.volumes.insert_chunk(chunk.clone())?;
        let sinfo = self.space_info(chunk.flags, SubGroup::Primary);
        self.make_block_group(&chunk, &sinfo, used, false)
    }

    fn chunk_size_for(&self, flags: BlockGroupFlags) -> u64 {
        let size = if flags.is_data() {
            self.config.data_chunk_size
        } else if flags.contains(BlockGroupFlags::SYSTEM) {
            self.config.system_chunk_size
        } else {
            self.config.metadata_chunk_size
        };
        if self.config.zoned && self.config.zone_size > 0 {
            size.min(self.config.zone_size)
        } else {
            size
        }
    }

    /// Allocate a new chunk for `flags` into `sinfo` and make it an empty,
    /// fully cached group.
    pub fn alloc_chunk_into(&self, sinfo: &Arc<SpaceInfo>, flags: BlockGroupFlags) -> Result<Arc<BlockGroup>> {
        let chunk = self.volumes.alloc_chunk(flags, self.chunk_size_for(flags))?;
        self.make_block_group(&chunk, sinfo, 0, true)
    }

    pub fn alloc_chunk(&self, flags: BlockGroupFlags) -> Result<Arc<BlockGroup>> {
        let sinfo = self.space_info(flags, SubGroup::Primary);
        self.alloc_chunk_into(&sinfo, flags)
    }

    /// Finish loading every group whose caching has started.
    pub fn run_pending_caching(&self, cx: &Cx) -> Result<()> {
        let caching = self.caching();
        for bg in self.block_groups() {
            if bg.lock().cached == CacheState::Started {
                caching.wait_done(cx, &bg)?;
            }
        }
        Ok(())
    }

    /// Load `bg`'s free space, optionally waiting for it to finish.
    pub fn cache_block_group(&self, cx: &Cx, bg: &BlockGroup, wait: bool) -> Result<()> {
        let caching = self.caching();
        caching.start(bg);
        if wait {
            caching.wait_done(cx, bg)?;
        }
        Ok(())
    }

    // ── Extent search ───────────────────────────────────────────────────────

    fn fetch_cluster(&self, sinfo: &SpaceInfo) -> (Option<&FreeCluster>, u64) {
        if self.config.zoned || sinfo.is_mixed() {
            return (None, 0);
        }
        if sinfo.flags().contains(BlockGroupFlags::METADATA) {
            let empty = if self.config.ssd { SZ_2M } else { SZ_64K };
            (Some(&self.meta_cluster), empty)
        } else if sinfo.flags().is_data() && self.config.ssd_spread {
            (Some(&self.data_cluster), SZ_2M)
        } else {
            (None, 0)
        }
    }

    /// Find and reserve `req.num_bytes` contiguous bytes.
    ///
    /// On failure the error carries the largest free extent seen, which is
    /// also recorded in the space info so oversized retries fail fast.
    ///
    /// `cx` is checked before every pass and every group, never while a
    /// range is half reserved.
    pub fn find_free_extent(&self, cx: &Cx, req: &AllocRequest) -> Result<FoundExtent> {
        let sectorsize = self.config.sectorsize;
        if req.num_bytes == 0 || req.num_bytes % sectorsize != 0 {
            return Err(FxtError::InvalidArgument(format!(
                "allocation of {} bytes is not sector aligned",
                req.num_bytes
            )));
        }
        let sinfo = self.resolve_space_info(req);
        let mut ctl = FfeCtl::new(req);
        let mut cluster = None;

        if self.config.zoned {
            self.dedicated.prepare_hint(&mut ctl);
        } else {
            let max = sinfo.max_extent_size();
            if max != 0 {
                if ctl.num_bytes > max {
                    return Err(FxtError::NoSpace { max_extent_size: max });
                }
                ctl.use_cluster = false;
            }
            let (found, empty_cluster) = self.fetch_cluster(&sinfo);
            cluster = found;
            ctl.empty_cluster = empty_cluster;
            if let Some(cluster) = cluster {
                let state = cluster.lock();
                if state.block_group.is_some() {
                    ctl.hint_byte = state.window_start;
                }
                if state.fragmented {
                    ctl.hint_byte = state.window_start;
                    ctl.use_cluster = false;
                }
            }
        }

        ctl.search_start = self.first_logical_byte().max(ctl.hint_byte);
        let mut resume = None;
        if ctl.search_start == ctl.hint_byte {
            if let Some(bg) = self.block_group(ctl.search_start) {
                let usable = bg.has_bits(ctl.flags)
                    && Arc::ptr_eq(bg.space_info(), &sinfo)
                    && bg.lock().cached != CacheState::NotStarted
                    && !bg.is_readonly();
                let index = bg.flags().profile().raid_index();
                let pos = sinfo.groups_at(index).iter().position(|&s| s == bg.start());
                if let (true, Some(pos)) = (usable, pos) {
                    ctl.index = index;
                    resume = Some((pos, bg));
                }
            }
        }

        let found = loop {
            cx_checkpoint(cx)?;
            if let Some(found) = self.search_pass(cx, &sinfo, cluster, &mut ctl, resume.take())? {
                break Some(found);
            }
            if !self.update_loop(&sinfo, &mut ctl)? {
                break None;
            }
        };

        if let Some((bg, start)) = found {
            trace!(
                group = bg.start(),
                start,
                num_bytes = ctl.num_bytes,
                phase = %ctl.phase,
                "extent reserved"
            );
            return Ok(FoundExtent {
                start,
                len: ctl.num_bytes,
                phases: ctl.phases,
            });
        }

        if let Some(err) = ctl.cache_error.take() {
            return Err(err);
        }
        let max_extent_size = if ctl.max_extent_size == 0 {
            ctl.total_free_space
        } else {
            ctl.max_extent_size
        };
        sinfo.set_max_extent_size(max_extent_size);
        debug!(
            num_bytes = ctl.num_bytes,
            max_extent_size,
            flags = %ctl.flags,
            "no space for extent"
        );
        Err(FxtError::NoSpace { max_extent_size })
    }

    /// One walk over the groups at `ctl.index`.
    fn search_pass(
        &self,
        cx: &Cx,
        sinfo: &Arc<SpaceInfo>,
        cluster: Option<&FreeCluster>,
        ctl: &mut FfeCtl,
        resume: Option<(usize, Arc<BlockGroup>)>,
    ) -> Result<Option<(Arc<BlockGroup>, u64)>> {
        ctl.have_caching_bg = false;
        if ctl.index == ctl.flags.profile().raid_index() || ctl.index == 0 {
            ctl.full_search = true;
        }
        let list = sinfo.groups_at(ctl.index);
        let (first, mut hinted) = match resume {
            Some((pos, bg)) => (pos, Some(bg)),
            None => (0, None),
        };

        for &group_start in list.iter().skip(first) {
            let bg = match hinted.take() {
                Some(bg) => bg,
                None => {
                    let Some(bg) = self.block_group_at(group_start) else {
                        continue;
                    };
                    if bg.is_readonly() {
                        if ctl.for_data_reloc {
                            self.dedicated.clear_data_reloc(bg.start());
                        }
                        continue;
                    }
                    ctl.search_start = bg.start();
                    if !bg.has_bits(ctl.flags) {
                        continue;
                    }
                    bg
                }
            };
            cx_checkpoint(cx)?;
            if let Some(found) = self.try_group(cx, cluster, &bg, ctl)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Attempt `bg`, once more after waiting on its caching if needed.
    fn try_group(
        &self,
        cx: &Cx,
        cluster: Option<&FreeCluster>,
        bg: &Arc<BlockGroup>,
        ctl: &mut FfeCtl,
    ) -> Result<Option<(Arc<BlockGroup>, u64)>> {
        ctl.retry_uncached = false;
        loop {
            if let Some(found) = self.attempt_group(cluster, bg, ctl)? {
                return Ok(Some(found));
            }
            if !ctl.cached && ctl.phase > LoopPhase::CachingNowait && !ctl.retry_uncached {
                ctl.retry_uncached = true;
                let need = ctl.num_bytes + ctl.empty_cluster + ctl.empty_size;
                let caching = self.caching();
                match caching
                    .run_batch(cx, bg)
                    .and_then(|_| caching.wait_progress(cx, bg, need))
                {
                    Ok(()) => {}
                    Err(FxtError::Cancelled) => return Err(FxtError::Cancelled),
                    Err(err) => debug!(group = bg.start(), error = %err, "caching wait failed"),
                }
                continue;
            }
            return Ok(None);
        }
    }

    fn attempt_group(
        &self,
        cluster: Option<&FreeCluster>,
        bg: &Arc<BlockGroup>,
        ctl: &mut FfeCtl,
    ) -> Result<Option<(Arc<BlockGroup>, u64)>> {
        ctl.cached = bg.is_caching_done();
        if !ctl.cached {
            ctl.have_caching_bg = true;
            self.caching().start(bg);
        }
        if bg.lock().cached == CacheState::Error {
            if ctl.cache_error.is_none() {
                ctl.cache_error = Some(FxtError::Io(std::io::Error::other(format!(
                    "block group {} failed to cache",
                    bg.start()
                ))));
            }
            return Ok(None);
        }
        if !self.check_size_class(bg, ctl) {
            return Ok(None);
        }
        let Some(target) = self.do_allocation(cluster, bg, ctl)? else {
            return Ok(None);
        };

        let found = ctl.found_offset;
        let num = ctl.num_bytes;
        ctl.search_start = align_up(found, self.config.sectorsize).unwrap_or(found);
        if ctl.search_start.saturating_add(num) > target.end() {
            target.add_free_space(found, num)?;
            return Ok(None);
        }
        if found < ctl.search_start {
            target.add_free_space(found, ctl.search_start - found)?;
        }
        match target.add_reserved_bytes(
            ctl.ram_bytes,
            num,
            ctl.delalloc,
            ctl.phase >= LoopPhase::WrongSizeClass,
            self.config.size_classes,
        ) {
            Ok(()) => Ok(Some((target, ctl.search_start))),
            Err(FxtError::Again) => {
                target.add_free_space(ctl.search_start, num)?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn check_size_class(&self, bg: &BlockGroup, ctl: &FfeCtl) -> bool {
        if !bg.should_use_size_class(self.config.size_classes) {
            return true;
        }
        if ctl.phase >= LoopPhase::WrongSizeClass {
            return true;
        }
        let class = bg.lock().size_class;
        if ctl.phase >= LoopPhase::UnsetSizeClass && class == SizeClass::None {
            return true;
        }
        class == ctl.size_class
    }

    fn do_allocation(
        &self,
        cluster: Option<&FreeCluster>,
        bg: &Arc<BlockGroup>,
        ctl: &mut FfeCtl,
    ) -> Result<Option<Arc<BlockGroup>>> {
        if self.config.zoned {
            return Ok(self
                .dedicated
                .do_allocation_zoned(bg, ctl)
                .then(|| Arc::clone(bg)));
        }
        if let Some(cluster) = cluster.filter(|_| ctl.use_cluster) {
            match self.alloc_clustered(cluster, bg, ctl)? {
                ClusterOutcome::Found(target) => return Ok(Some(target)),
                ClusterOutcome::NextGroup => return Ok(None),
                ClusterOutcome::Unclustered => {}
            }
        }
        Ok(self.alloc_unclustered(cluster, bg, ctl).then(|| Arc::clone(bg)))
    }

    fn alloc_clustered(
        &self,
        cluster: &FreeCluster,
        bg: &Arc<BlockGroup>,
        ctl: &mut FfeCtl,
    ) -> Result<ClusterOutcome> {
        let mut state = cluster.lock();
        if let Some(cluster_start) = state.block_group {
            let cluster_bg = if cluster_start == bg.start() {
                Some(Arc::clone(bg))
            } else {
                self.block_group_at(cluster_start)
            };
            match cluster_bg {
                Some(cluster_bg) => {
                    let own = cluster_bg.start() == bg.start();
                    if own || (!cluster_bg.is_readonly() && cluster_bg.has_bits(ctl.flags)) {
                        match state.alloc(&cluster_bg, ctl.num_bytes, cluster_bg.start()) {
                            Ok(offset) => {
                                ctl.found_offset = offset;
                                trace!(group = cluster_bg.start(), offset, "allocated from cluster");
                                return Ok(ClusterOutcome::Found(cluster_bg));
                            }
                            Err(max) => ctl.note_max_extent(max),
                        }
                    }
                    if ctl.phase >= LoopPhase::NoEmptySize && !own {
                        return Ok(ClusterOutcome::Unclustered);
                    }
                    state.release(&cluster_bg)?;
                }
                None => {
                    let fragmented = state.fragmented;
                    *state = ClusterState {
                        fragmented,
                        ..ClusterState::default()
                    };
                }
            }
        }

        if ctl.phase >= LoopPhase::NoEmptySize {
            return Ok(ClusterOutcome::Unclustered);
        }
        // Mirror profiles have a full stripe of one sector.
        let aligned_cluster = (ctl.empty_cluster + ctl.empty_size).max(self.config.sectorsize);
        let policy = ClusterPolicy {
            ssd_spread: self.config.ssd_spread,
            sectorsize: self.config.sectorsize,
        };
        if state
            .refill(bg, policy, ctl.search_start, ctl.num_bytes, aligned_cluster)
            .is_ok()
        {
            match state.alloc(bg, ctl.num_bytes, ctl.search_start) {
                Ok(offset) => {
                    ctl.found_offset = offset;
                    return Ok(ClusterOutcome::Found(Arc::clone(bg)));
                }
                Err(max) => ctl.note_max_extent(max),
            }
        }
        state.release(bg)?;
        Ok(ClusterOutcome::NextGroup)
    }

    fn alloc_unclustered(&self, cluster: Option<&FreeCluster>, bg: &BlockGroup, ctl: &mut FfeCtl) -> bool {
        if let Some(cluster) = cluster {
            cluster.set_fragmented(true);
        }
        let mut state = bg.lock();
        if ctl.cached {
            let free = state.free_space.free_space();
            if free < ctl.num_bytes + ctl.empty_cluster + ctl.empty_size {
                ctl.total_free_space = ctl.total_free_space.max(free);
                return false;
            }
        }
        match state.free_space.find_space_for_alloc(
            ctl.search_start,
            ctl.num_bytes,
            ctl.empty_size,
            self.config.sectorsize,
        ) {
            Ok(offset) => {
                ctl.found_offset = offset;
                true
            }
            Err(max) => {
                ctl.note_max_extent(max);
                false
            }
        }
    }

    /// Decide what the next pass looks like. Returns `false` when the
    /// search is over.
    fn update_loop(&self, sinfo: &Arc<SpaceInfo>, ctl: &mut FfeCtl) -> Result<bool> {
        if ctl.phase == LoopPhase::CachingNowait && ctl.have_caching_bg {
            ctl.orig_have_caching_bg = true;
        }
        if ctl.phase >= LoopPhase::CachingWait && ctl.have_caching_bg {
            return Ok(true);
        }
        ctl.index += 1;
        if ctl.index < RaidProfile::COUNT {
            return Ok(true);
        }
        if ctl.phase >= LoopPhase::NoEmptySize {
            return Ok(false);
        }
        ctl.index = 0;
        if ctl.phase == LoopPhase::CachingNowait && !ctl.orig_have_caching_bg && ctl.full_search {
            // Nothing is loading and every group was seen: waiting is pointless.
            ctl.phase = LoopPhase::CachingWait;
        }
        ctl.advance_phase();

        if ctl.phase == LoopPhase::AllocChunk {
            if !self.dedicated.can_allocate_chunk(self.config.zoned, ctl) {
                return Ok(false);
            }
            match self.alloc_chunk_into(sinfo, ctl.flags) {
                Ok(bg) => debug!(group = bg.start(), length = bg.length(), "chunk allocated for search"),
                Err(FxtError::NoSpace { .. }) => ctl.advance_phase(),
                Err(err) => return Err(err),
            }
        }

        if ctl.phase == LoopPhase::NoEmptySize {
            if self.config.zoned || (ctl.empty_size == 0 && ctl.empty_cluster == 0) {
                return Ok(false);
            }
            ctl.empty_size = 0;
            ctl.empty_cluster = 0;
        }
        Ok(true)
    }

    /// Reserve an extent, halving the request on `NoSpace` until
    /// `min_alloc_size` has been tried.
    pub fn reserve_extent(&self, cx: &Cx, req: &AllocRequest) -> Result<FoundExtent> {
        let sectorsize = self.config.sectorsize;
        let mut attempt = *req;
        let mut final_tried = attempt.num_bytes == attempt.min_alloc_size;
        loop {
            match self.find_free_extent(cx, &attempt) {
                Err(FxtError::NoSpace { max_extent_size }) if !final_tried && max_extent_size != 0 => {
                    let halved = (attempt.num_bytes >> 1).min(max_extent_size);
                    let num = align_down(halved, sectorsize)
                        .unwrap_or(halved)
                        .max(attempt.min_alloc_size);
                    attempt.num_bytes = num;
                    attempt.ram_bytes = num;
                    if num == attempt.min_alloc_size {
                        final_tried = true;
                    }
                    debug!(num_bytes = num, max_extent_size, "retrying smaller reservation");
                }
                other => return other,
            }
        }
    }

    // ── Reservation lifecycle ───────────────────────────────────────────────

    fn group_for(&self, bytenr: u64) -> Result<Arc<BlockGroup>> {
        self.block_group(bytenr)
            .ok_or_else(|| FxtError::NotFound(format!("no block group contains {bytenr}")))
    }

    /// Give back a reservation that never became an extent item.
    pub fn free_reserved_extent(&self, cx: &Cx, start: u64, len: u64, delalloc: bool) -> Result<()> {
        let bg = self.group_for(start)?;
        if self.config.discard_sync {
            self.discard_quietly(cx, start, len);
        }
        bg.add_free_space(start, len)?;
        bg.free_reserved_bytes(len, delalloc);
        trace!(start, len, "reservation returned");
        Ok(())
    }

    /// Pin `[start, start + len)` until commit.
    ///
    /// With `reserved`, the bytes move from reserved to pinned; otherwise they
    /// are pinned on top of their current accounting.
    pub fn pin_extent(&self, start: u64, len: u64, reserved: bool) -> Result<()> {
        let bg = self.group_for(start)?;
        bg.pin(len, reserved);
        self.pins.pin(start, len);
        trace!(start, len, reserved, "extent pinned");
        Ok(())
    }

    /// Move accounting when an extent item is inserted (`alloc`) or deleted.
    ///
    /// Deleted ranges are pinned.
    pub fn update_block_group(&self, bytenr: u64, num_bytes: u64, alloc: bool) -> Result<()> {
        let mut cursor = bytenr;
        let mut left = num_bytes;
        while left > 0 {
            let bg = self.group_for(cursor)?;
            let len = left.min(bg.end() - cursor);
            if alloc {
                bg.account_alloc(len)?;
            } else {
                bg.account_free(len)?;
                self.pins.pin(cursor, len);
            }
            cursor += len;
            left -= len;
        }
        Ok(())
    }

    /// Release pinned bytes in `[start, end)`, returning them to the free
    /// pool when `return_free_space`.
    pub fn unpin_extent_range(&self, start: u64, end: u64, return_free_space: bool) -> Result<()> {
        let mut cursor = start;
        let mut current: Option<(Arc<BlockGroup>, u64)> = None;
        while cursor < end {
            let (bg, total_unpinned) = match current.take() {
                Some((bg, total)) if cursor < bg.end() => (bg, total),
                _ => (self.group_for(cursor)?, 0),
            };
            let len = (bg.end() - cursor).min(end - cursor);
            if return_free_space {
                bg.add_free_space(cursor, len)?;
            }
            let total_unpinned = total_unpinned + len;
            let (cluster, empty_cluster) = self.fetch_cluster(bg.space_info());
            if let Some(cluster) = cluster {
                if cluster.is_fragmented() && total_unpinned > empty_cluster << 1 {
                    cluster.set_fragmented(false);
                }
            }
            bg.unpin(len);
            cursor += len;
            current = Some((bg, total_unpinned));
        }
        Ok(())
    }

    /// Commit: every range pinned by the committing transaction goes back to
    /// the free pool, discarded first if configured.
    ///
    /// Runs to completion even under a cancelled `cx`; only the discards are
    /// skipped.
    pub fn finish_extent_commit(&self, cx: &Cx) -> Result<u64> {
        let ranges = self.pins.take_for_commit();
        let mut bytes = 0_u64;
        for range in &ranges {
            if self.config.discard_sync {
                self.discard_quietly(cx, range.start, range.len);
            }
            self.unpin_extent_range(range.start, range.end(), true)?;
            bytes += range.len;
        }
        info!(ranges = ranges.len(), bytes, "unpinned committed extents");
        Ok(bytes)
    }

    /// Abort: the running transaction's pinned ranges never return to the
    /// free pool.
    pub fn abandon_pinned(&self) -> Vec<PhysRange> {
        let ranges = self.pins.strand();
        let bytes: u64 = ranges.iter().map(|r| r.len).sum();
        info!(ranges = ranges.len(), bytes, "pinned extents stranded by abort");
        ranges
    }

    fn discard_quietly(&self, cx: &Cx, start: u64, len: u64) {
        if let Err(err) = self.discard_extent(cx, start, len) {
            warn!(start, len, error = %err, "discard failed");
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Whether any byte of `range` is in some group's free-space index.
    #[must_use]
    pub fn contains_free(&self, range: PhysRange) -> bool {
        let groups = self.groups.read();
        groups
            .values()
            .filter(|bg| bg.range().overlaps(range))
            .any(|bg| {
                let state = bg.lock();
                if bg.is_zoned() {
                    let write_pointer = bg.start() + state.alloc_offset;
                    return range.end() > write_pointer;
                }
                state.free_space.overlaps_free(range)
            })
    }

    #[must_use]
    pub fn is_pinned(&self, range: PhysRange) -> bool {
        self.pins.is_pinned(range)
    }

    /// Σ over groups of reserved plus pinned bytes.
    #[must_use]
    pub fn reserved_and_pinned(&self) -> u64 {
        self.groups
            .read()
            .values()
            .map(|bg| {
                let state = bg.lock();
                state.reserved + state.pinned
            })
            .sum()
    }

    #[must_use]
    pub fn snapshot(&self) -> AllocSnapshot {
        AllocSnapshot {
            space_infos: self
                .space_infos()
                .iter()
                .map(|s| SpaceInfoSnapshot {
                    flags: s.flags(),
                    subgroup: s.subgroup(),
                    counters: s.counters(),
                })
                .collect(),
            groups: self.block_groups().iter().map(|bg| bg.snapshot()).collect(),
            pinned: self.pins.current().iter().collect(),
            stranded: self.pins.stranded().iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxt_block::{BlockDevice, MemBlockDevice};
    use fxt_btree::MemItemStore;
    use fxt_types::{BtrfsKey, EXTENT_ITEM_KEY, SZ_1M};

    fn setup(config: AllocConfig, dev_bytes: u64) -> (FsAlloc, Arc<MemItemStore>) {
        let volumes = Arc::new(Volumes::new(SZ_1M * 16));
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(1, dev_bytes));
        volumes.add_device(dev).expect("device");
        let store = Arc::new(MemItemStore::new(16_384));
        let alloc = FsAlloc::new(config, volumes, Arc::clone(&store) as Arc<dyn ItemStore>);
        (alloc, store)
    }

    fn small_chunks() -> AllocConfig {
        AllocConfig {
            data_chunk_size: SZ_1M * 8,
            metadata_chunk_size: SZ_1M * 4,
            ..AllocConfig::default()
        }
    }

    #[test]
    fn first_allocation_creates_a_chunk() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1G);
        let found = alloc.find_free_extent(&cx, &AllocRequest::data(4096)).expect("alloc");
        assert_eq!(found.phases.last(), Some(&LoopPhase::AllocChunk));
        let bg = alloc.block_group(found.start).expect("group");
        assert_eq!(bg.lock().reserved, 4096);
        assert_eq!(bg.lock().size_class, SizeClass::Small);
        let again = alloc.find_free_extent(&cx, &AllocRequest::data(4096)).expect("alloc");
        assert_eq!(again.phases, vec![LoopPhase::CachingNowait]);
        assert_ne!(again.start, found.start);
    }

    #[test]
    fn hint_selects_the_group() {
        let cx = Cx::for_testing();
        let config = AllocConfig {
            size_classes: false,
            ..small_chunks()
        };
        let (alloc, _) = setup(config, SZ_1G);
        let first = alloc.alloc_chunk(BlockGroupFlags::DATA).expect("first");
        let second = alloc.alloc_chunk(BlockGroupFlags::DATA).expect("second");
        let plain = alloc.find_free_extent(&cx, &AllocRequest::data(8192)).expect("plain");
        assert!(first.range().contains(plain.start));
        let hinted = alloc
            .find_free_extent(&cx, &AllocRequest::data(8192).with_hint(second.start() + SZ_1M))
            .expect("hinted");
        assert_eq!(hinted.start, second.start());
    }

    #[test]
    fn metadata_allocations_use_the_cluster() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1G);
        let a = alloc.find_free_extent(&cx, &AllocRequest::metadata(16_384)).expect("a");
        let b = alloc.find_free_extent(&cx, &AllocRequest::metadata(16_384)).expect("b");
        assert_eq!(b.start, a.start + 16_384);
        assert!(alloc.meta_cluster.lock().block_group.is_some());
    }

    #[test]
    fn enospc_records_largest_extent() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1M * 10);
        let bg = alloc.alloc_chunk(BlockGroupFlags::DATA).expect("chunk");
        assert_eq!(bg.length(), SZ_1M * 8);
        let err = alloc
            .find_free_extent(&cx, &AllocRequest::data(SZ_1M * 16))
            .expect_err("too big");
        assert_eq!(err.max_extent_size(), Some(SZ_1M * 8));
        assert_eq!(bg.space_info().max_extent_size(), SZ_1M * 8);
        // Oversized requests now fail without searching.
        let fast = alloc
            .find_free_extent(&cx, &AllocRequest::data(SZ_1M * 9))
            .expect_err("fast");
        assert_eq!(fast.max_extent_size(), Some(SZ_1M * 8));
    }

    #[test]
    fn reserve_extent_scales_down() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1M * 10);
        alloc.alloc_chunk(BlockGroupFlags::DATA).expect("chunk");
        let req = AllocRequest::data(SZ_1M * 32).with_min_alloc(4096);
        let found = alloc.reserve_extent(&cx, &req).expect("scaled");
        assert_eq!(found.len, SZ_1M * 8);
    }

    #[test]
    fn uncached_group_is_loaded_on_demand() {
        let cx = Cx::for_testing();
        let (alloc, store) = setup(small_chunks(), SZ_1G);
        let chunk = Chunk {
            logical: SZ_1M * 16,
            length: SZ_1M * 8,
            flags: BlockGroupFlags::DATA,
            stripes: vec![fxt_block::Stripe {
                devid: fxt_types::DeviceId(1),
                physical: SZ_1M * 4,
            }],
        };
        store
            .insert_item(BtrfsKey::new(SZ_1M * 16, EXTENT_ITEM_KEY, SZ_1M * 4), &[0; 24])
            .expect("extent");
        let bg = alloc.add_block_group(chunk, SZ_1M * 4).expect("group");
        assert!(!bg.is_cached());
        let found = alloc.find_free_extent(&cx, &AllocRequest::data(SZ_1M)).expect("alloc");
        assert!(bg.range().contains(found.start));
        assert!(found.start >= SZ_1M * 20);
        assert!(found.phases.contains(&LoopPhase::CachingWait));
    }

    #[test]
    fn size_class_relaxation_allocates_a_chunk() {
        let cx = Cx::for_testing();
        let config = AllocConfig {
            data_chunk_size: SZ_1M * 16,
            ..AllocConfig::default()
        };
        let (alloc, store) = setup(config, SZ_1G);
        // A cached large-class group with nothing left.
        let fill = alloc
            .find_free_extent(&cx, &AllocRequest::data(SZ_1M * 16))
            .expect("fill");
        let large = alloc.block_group(fill.start).expect("large");
        assert_eq!(large.lock().size_class, SizeClass::Large);
        // An uncached group holding one large extent.
        let logical = large.end();
        store
            .insert_item(BtrfsKey::new(logical, EXTENT_ITEM_KEY, SZ_1M * 16), &[0; 24])
            .expect("extent");
        let uncached = alloc
            .add_block_group(
                Chunk {
                    logical,
                    length: SZ_1M * 16,
                    flags: BlockGroupFlags::DATA,
                    stripes: vec![fxt_block::Stripe {
                        devid: fxt_types::DeviceId(1),
                        physical: SZ_1M * 32,
                    }],
                },
                SZ_1M * 16,
            )
            .expect("uncached");

        let found = alloc.find_free_extent(&cx, &AllocRequest::data(SZ_1M)).expect("alloc");
        assert_eq!(
            found.phases,
            vec![
                LoopPhase::CachingNowait,
                LoopPhase::CachingWait,
                LoopPhase::UnsetSizeClass,
                LoopPhase::AllocChunk,
            ]
        );
        assert!(!large.range().contains(found.start));
        assert!(!uncached.range().contains(found.start));
        assert!(uncached.is_cached());
        assert_eq!(uncached.lock().size_class, SizeClass::Large);
        let fresh = alloc.block_group(found.start).expect("fresh");
        assert_eq!(fresh.lock().size_class, SizeClass::Medium);
    }

    #[test]
    fn pin_unpin_cycle() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1G);
        let found = alloc.find_free_extent(&cx, &AllocRequest::data(65_536)).expect("alloc");
        let range = found.range();
        alloc.update_block_group(range.start, range.len, true).expect("used");
        alloc.update_block_group(range.start, range.len, false).expect("freed");
        assert!(alloc.is_pinned(range));
        assert!(!alloc.contains_free(range));
        assert_eq!(alloc.reserved_and_pinned(), 65_536);
        assert_eq!(alloc.finish_extent_commit(&cx).expect("commit"), 65_536);
        assert!(alloc.contains_free(range));
        assert_eq!(alloc.reserved_and_pinned(), 0);
    }

    #[test]
    fn abort_strands_pinned_ranges() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1G);
        let found = alloc.find_free_extent(&cx, &AllocRequest::data(65_536)).expect("alloc");
        alloc.pin_extent(found.start, found.len, true).expect("pin");
        assert_eq!(alloc.abandon_pinned(), vec![found.range()]);
        assert_eq!(alloc.finish_extent_commit(&cx).expect("commit"), 0);
        assert!(!alloc.contains_free(found.range()));
        assert!(alloc.is_pinned(found.range()));
    }

    #[test]
    fn free_reserved_extent_returns_space() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1G);
        let found = alloc.find_free_extent(&cx, &AllocRequest::data(8192)).expect("alloc");
        alloc.free_reserved_extent(&cx, found.start, found.len, false).expect("free");
        assert!(alloc.contains_free(found.range()));
        assert_eq!(alloc.reserved_and_pinned(), 0);
    }

    #[test]
    fn unaligned_requests_are_rejected() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1G);
        assert!(matches!(
            alloc.find_free_extent(&cx, &AllocRequest::data(1000)),
            Err(FxtError::InvalidArgument(_))
        ));
    }

    #[test]
    fn cancelled_search_reserves_nothing() {
        let cx = Cx::for_testing();
        let (alloc, _) = setup(small_chunks(), SZ_1G);
        let bg = alloc.alloc_chunk(BlockGroupFlags::DATA).expect("chunk");
        cx.set_cancel_requested(true);
        assert!(matches!(
            alloc.find_free_extent(&cx, &AllocRequest::data(4096)),
            Err(FxtError::Cancelled)
        ));
        assert_eq!(alloc.reserved_and_pinned(), 0);
        assert_eq!(bg.free_bytes(), SZ_1M * 8);

        let found = alloc
            .find_free_extent(&Cx::for_testing(), &AllocRequest::data(4096))
            .expect("alloc");
        assert!(bg.range().contains(found.start));
    }
}
