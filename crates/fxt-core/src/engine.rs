//! The extent tree engine: allocation, queued reference changes, commit and
//! abort tied together behind one handle.

use crate::config::{FsLayout, MountOptions};
use crate::runner::{ExtentRunner, ref_identity};
use crate::state::{FsState, FsStatus};
use crate::trans::{AbortReport, CommitReport, TransHandle, TransState};
use asupersync::Cx;
use fxt_alloc::{
    AllocRequest, AllocSnapshot, FoundExtent, FsAlloc, ReclaimFlags, SplitAllocPool, TrimReport,
};
use fxt_block::{MemBlockDevice, Volumes, issue_discard};
use fxt_btree::{ItemStore, MemItemStore};
use fxt_btrfs::{
    BlockCheck, BlockRef, BlockStore, ExtentInfo, RootItem, TreeBlock, child_refs,
};
use fxt_delayed_ref::{
    DelayedRef, DelayedRefRoot, DelayedRefsSnapshot, RefAction, RefKind, RefNode, RunStats,
    TreeModLog,
};
use fxt_error::{FxtError, Result};
use fxt_extent::{CommittedRef, ExtentStore, ExtentTarget, RefIdentity, RootRef};
use fxt_types::{BLOCK_FLAG_FULL_BACKREF, BtrfsKey, DeviceId, ExtentOp, PhysRange};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub status: FsStatus,
    pub last_committed: u64,
    pub running_transid: Option<u64>,
    pub alloc: AllocSnapshot,
    pub delayed_refs: DelayedRefsSnapshot,
    pub roots: Vec<RootItem>,
}

pub struct ExtentTree {
    pub(crate) options: MountOptions,
    pub(crate) items: Arc<dyn ItemStore>,
    pub(crate) extents: ExtentStore,
    pub(crate) alloc: Arc<FsAlloc>,
    pub(crate) delayed: DelayedRefRoot,
    pub(crate) blocks: BlockStore,
    pub(crate) roots: Mutex<BTreeMap<u64, RootItem>>,
    pub(crate) state: FsState,
    pub(crate) trans: Mutex<TransState>,
    split_pool: Option<SplitAllocPool>,
}

impl fmt::Debug for ExtentTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtentTree")
            .field("nodesize", &self.options.nodesize)
            .field("heads", &self.delayed.num_heads())
            .field("status", &self.state.status())
            .finish_non_exhaustive()
    }
}

impl ExtentTree {
    /// Mount over existing volumes and extent items.
    pub fn new(
        options: MountOptions,
        volumes: Arc<Volumes>,
        items: Arc<dyn ItemStore>,
    ) -> Result<Self> {
        options.validate()?;
        if items.nodesize() != options.nodesize {
            return Err(FxtError::InvalidGeometry(format!(
                "item store nodesize {} differs from mount nodesize {}",
                items.nodesize(),
                options.nodesize
            )));
        }
        let devices: Vec<_> = volumes
            .device_ids()
            .into_iter()
            .filter_map(|devid| volumes.device(devid))
            .collect();
        if devices.is_empty() {
            return Err(FxtError::InvalidGeometry("no devices".to_owned()));
        }
        let zone_size = devices.iter().find_map(|dev| dev.zone_size()).unwrap_or(0);
        if options.zoned && zone_size == 0 {
            return Err(FxtError::InvalidGeometry(
                "zoned mount needs zoned devices".to_owned(),
            ));
        }
        let read_only = devices.iter().all(|dev| !dev.is_writable());
        let split_pool = if options.offload_split_alloc {
            Some(SplitAllocPool::new(options.split_workers)?)
        } else {
            None
        };
        let alloc = Arc::new(FsAlloc::new(
            options.alloc_config(zone_size),
            Arc::clone(&volumes),
            Arc::clone(&items),
        ));
        let extents = ExtentStore::new(
            Arc::clone(&items),
            options.sectorsize,
            options.skinny_metadata,
        );
        info!(
            nodesize = options.nodesize,
            sectorsize = options.sectorsize,
            devices = devices.len(),
            zone_size,
            read_only,
            "extent_tree_open"
        );
        Ok(Self {
            blocks: BlockStore::new(options.nodesize),
            options,
            items,
            extents,
            alloc,
            delayed: DelayedRefRoot::new(Arc::new(TreeModLog::new())),
            roots: Mutex::new(BTreeMap::new()),
            state: FsState::new(read_only),
            trans: Mutex::new(TransState::default()),
            split_pool,
        })
    }

    /// Mount over fresh in-memory devices, allocating the layout's chunks.
    ///
    /// The concrete devices are returned so callers can inspect the
    /// commands they received.
    pub fn open_layout(
        options: MountOptions,
        layout: &FsLayout,
    ) -> Result<(Self, Vec<Arc<MemBlockDevice>>)> {
        layout.validate()?;
        let volumes = Arc::new(Volumes::new(layout.first_logical));
        let mut handles = Vec::with_capacity(layout.devices.len());
        for (dev, erased) in layout.mem_devices() {
            volumes.add_device(erased)?;
            handles.push(dev);
        }
        let items: Arc<dyn ItemStore> = Arc::new(MemItemStore::new(options.nodesize));
        let tree = Self::new(options, volumes, items)?;
        for group in &layout.groups {
            for _ in 0..group.count {
                tree.alloc.alloc_chunk(group.flags)?;
            }
        }
        Ok((tree, handles))
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn items(&self) -> &Arc<dyn ItemStore> {
        &self.items
    }

    #[must_use]
    pub fn extents(&self) -> &ExtentStore {
        &self.extents
    }

    #[must_use]
    pub fn alloc(&self) -> &Arc<FsAlloc> {
        &self.alloc
    }

    #[must_use]
    pub fn delayed_refs(&self) -> &DelayedRefRoot {
        &self.delayed
    }

    #[must_use]
    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    #[must_use]
    pub fn state(&self) -> &FsState {
        &self.state
    }

    #[must_use]
    pub fn last_committed(&self) -> u64 {
        self.trans.lock().last_committed
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        let (last_committed, running_transid) = {
            let ts = self.trans.lock();
            (ts.last_committed, ts.running.then_some(ts.transid))
        };
        EngineSnapshot {
            status: self.state.status(),
            last_committed,
            running_transid,
            alloc: self.alloc.snapshot(),
            delayed_refs: self.delayed.snapshot(),
            roots: self.roots.lock().values().copied().collect(),
        }
    }

    /// Check every committed extent item against its back-references.
    pub fn verify_refs(&self) -> Result<usize> {
        self.extents
            .verify_all()
            .inspect_err(|err| self.note_error(err))
    }

    // ── Transactions ────────────────────────────────────────────────────────

    /// Join the running transaction, starting one when none runs.
    ///
    /// Work done through the handle is cancellable through `cx`.
    pub fn start_transaction<'a>(&'a self, cx: &'a Cx) -> Result<TransHandle<'a>> {
        self.state.check_writable()?;
        let mut ts = self.trans.lock();
        if !ts.running {
            ts.running = true;
            ts.transid = ts.last_committed + 1;
            ts.handles = 0;
            ts.new_blocks.clear();
            debug!(transid = ts.transid, "transaction_start");
        }
        ts.handles += 1;
        Ok(TransHandle::new(self, cx, ts.transid))
    }

    pub(crate) fn join_transaction<'a>(&'a self, cx: &'a Cx, transid: u64) -> Result<TransHandle<'a>> {
        self.state.check_writable()?;
        let mut ts = self.trans.lock();
        if !ts.running || ts.transid != transid {
            return Err(FxtError::NotFound(format!(
                "transaction {transid} is not running"
            )));
        }
        ts.handles += 1;
        Ok(TransHandle::new(self, cx, transid))
    }

    pub(crate) fn release_handle(&self, transid: u64) {
        let mut ts = self.trans.lock();
        if ts.running && ts.transid == transid {
            ts.handles = ts.handles.saturating_sub(1);
        }
    }

    /// Refuse work on a handle whose transaction is gone or was aborted.
    pub(crate) fn check_handle(&self, trans: &TransHandle<'_>) -> Result<()> {
        self.state.check_writable()?;
        let ts = self.trans.lock();
        if !ts.running || ts.transid != trans.generation() {
            return Err(FxtError::NotFound(format!(
                "transaction {} is not running",
                trans.generation()
            )));
        }
        Ok(())
    }

    pub(crate) fn commit_transaction(&self, cx: &Cx, transid: u64) -> Result<CommitReport> {
        {
            let mut ts = self.trans.lock();
            if !ts.running || ts.transid != transid {
                return Err(FxtError::NotFound(format!(
                    "transaction {transid} is not running"
                )));
            }
            ts.handles = ts.handles.saturating_sub(1);
            if ts.handles > 0 {
                debug!(transid, handles = ts.handles, "commit_deferred_to_last_handle");
                return Err(FxtError::Busy);
            }
        }
        if let Some(errno) = self.state.aborted() {
            self.abort_transaction(transid, errno);
            return Err(FxtError::Aborted { errno });
        }
        match self.commit_inner(cx, transid) {
            Ok(report) => Ok(report),
            Err(err) => {
                if err.is_transaction_fatal() || self.state.aborted().is_some() {
                    let errno = self.state.aborted().unwrap_or_else(|| err.to_errno());
                    self.abort_transaction(transid, errno);
                }
                Err(err)
            }
        }
    }

    fn commit_inner(&self, cx: &Cx, transid: u64) -> Result<CommitReport> {
        let mut total = RunStats::default();
        loop {
            let stats = self.run_delayed_refs_inner(cx, transid, u64::MAX)?;
            total.heads += stats.heads;
            total.refs += stats.refs;
            total.extent_ops += stats.extent_ops;
            total.bytes += stats.bytes;
            total.deferred += stats.deferred;
            total.pinned += stats.pinned;
            if self.delayed.is_empty() {
                break;
            }
            if stats.heads == 0 {
                // Every remaining head is held back by a tree-mod-log reader.
                warn!(transid, heads = self.delayed.num_heads(), "commit_blocked_by_readers");
                return Err(FxtError::Again);
            }
        }
        let unpinned_bytes = self.alloc.finish_extent_commit(cx)?;
        let new_blocks: Vec<u64> = {
            let ts = self.trans.lock();
            ts.new_blocks
                .iter()
                .copied()
                .filter(|&bytenr| self.blocks.contains(bytenr))
                .collect()
        };
        let blocks_written = self.blocks.mark_written(new_blocks)?;
        {
            let mut ts = self.trans.lock();
            ts.last_committed = transid;
            ts.running = false;
            ts.handles = 0;
            ts.new_blocks.clear();
        }
        info!(
            transid,
            heads = total.heads,
            refs = total.refs,
            unpinned_bytes,
            blocks_written,
            "transaction_committed"
        );
        Ok(CommitReport {
            transid,
            delayed_refs: total,
            unpinned_bytes,
            blocks_written,
        })
    }

    /// Throw the transaction away: queued refs are destroyed, their reserved
    /// ranges pinned, and every pinned range is stranded.
    pub(crate) fn abort_transaction(&self, transid: u64, errno: i32) -> AbortReport {
        self.state.abort(errno);
        let alloc = &self.alloc;
        let destroyed = self
            .delayed
            .destroy(|view| alloc.pin_extent(view.bytenr, view.num_bytes, true));
        let stranded = self.alloc.abandon_pinned();
        {
            let mut ts = self.trans.lock();
            if ts.running && ts.transid == transid {
                ts.running = false;
                ts.handles = 0;
                ts.new_blocks.clear();
            }
        }
        let report = AbortReport {
            transid,
            errno,
            destroyed,
            stranded,
        };
        warn!(
            transid,
            errno,
            heads = report.destroyed.heads,
            nodes = report.destroyed.nodes,
            stranded_bytes = report.stranded_bytes(),
            "transaction_aborted"
        );
        report
    }

    /// Fatal errors abort the running transaction; corruption also latches
    /// the fs sick.
    pub(crate) fn note_error(&self, err: &FxtError) {
        if let FxtError::Corruption { .. } = err {
            self.state.mark_sick(err);
        }
        if err.is_transaction_fatal() {
            self.state.abort(err.to_errno());
        }
    }

    // ── Delayed refs ────────────────────────────────────────────────────────

    /// Apply queued reference changes to the extent items.
    ///
    /// `min_bytes` of zero drains the heads ready now; `u64::MAX` drains
    /// everything.
    pub fn run_delayed_refs(&self, trans: &TransHandle<'_>, min_bytes: u64) -> Result<RunStats> {
        self.check_handle(trans)?;
        self.run_delayed_refs_inner(trans.cx(), trans.generation(), min_bytes)
    }

    fn run_delayed_refs_inner(&self, cx: &Cx, generation: u64, min_bytes: u64) -> Result<RunStats> {
        let mut runner = ExtentRunner::new(self, generation);
        self.delayed
            .run(cx, &mut runner, min_bytes)
            .inspect_err(|err| self.note_error(err))
    }

    pub(crate) fn throttle(&self, trans: &TransHandle<'_>) -> Result<Option<RunStats>> {
        self.check_handle(trans)?;
        let ready = self.delayed.num_heads_ready();
        if ready <= self.options.delayed_refs_throttle_heads {
            return Ok(None);
        }
        debug!(ready, "delayed_refs_throttle");
        self.run_delayed_refs_inner(trans.cx(), trans.generation(), 0)
            .map(Some)
    }

    pub(crate) fn queue_ref(&self, req: DelayedRef) -> Result<()> {
        if req.is_data {
            self.delayed.add_data_ref(req, req.num_bytes)
        } else {
            self.delayed.add_tree_ref(req, None)
        }
    }

    /// Queue one more reference on an existing extent.
    pub fn inc_extent_ref(&self, trans: &TransHandle<'_>, req: DelayedRef) -> Result<()> {
        self.check_handle(trans)?;
        if req.action != RefAction::AddRef {
            return Err(FxtError::InvalidArgument(format!(
                "inc_extent_ref with {:?}",
                req.action
            )));
        }
        self.queue_ref(req)
    }

    /// Queue the drop of one reference; the last one frees the extent.
    pub fn free_extent(&self, trans: &TransHandle<'_>, req: DelayedRef) -> Result<()> {
        self.check_handle(trans)?;
        if req.action != RefAction::DropRef {
            return Err(FxtError::InvalidArgument(format!(
                "free_extent with {:?}",
                req.action
            )));
        }
        self.queue_ref(req)
    }

    /// Queue flags to set on a tree block's extent item.
    pub fn set_disk_extent_flags(
        &self,
        trans: &TransHandle<'_>,
        bytenr: u64,
        num_bytes: u64,
        flags: u64,
    ) -> Result<()> {
        self.check_handle(trans)?;
        self.delayed
            .add_extent_op(bytenr, num_bytes, ExtentOp::set_flags(flags))
    }

    /// Add a reference from `block` to each of its children.
    pub fn inc_ref(&self, trans: &TransHandle<'_>, block: &TreeBlock, full_backref: bool) -> Result<usize> {
        self.mod_refs(trans, block, full_backref, RefAction::AddRef)
    }

    /// Drop the references `block` holds on its children.
    pub fn dec_ref(&self, trans: &TransHandle<'_>, block: &TreeBlock, full_backref: bool) -> Result<usize> {
        self.mod_refs(trans, block, full_backref, RefAction::DropRef)
    }

    fn mod_refs(
        &self,
        trans: &TransHandle<'_>,
        block: &TreeBlock,
        full_backref: bool,
        action: RefAction,
    ) -> Result<usize> {
        self.check_handle(trans)?;
        let refs = child_refs(block, full_backref, self.options.nodesize)?;
        for block_ref in &refs {
            self.queue_ref(block_ref_request(action, block_ref)?)?;
        }
        trace!(
            bytenr = block.bytenr,
            level = block.level,
            refs = refs.len(),
            ?action,
            full_backref,
            "mod_refs"
        );
        Ok(refs.len())
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    /// Reserve space; the caller must queue the extent or free the range.
    pub fn reserve_extent(&self, trans: &TransHandle<'_>, req: &AllocRequest) -> Result<FoundExtent> {
        self.check_handle(trans)?;
        self.alloc.reserve_extent(trans.cx(), req)
    }

    /// Hand back a reservation that never became an extent.
    pub fn free_reserved_extent(&self, trans: &TransHandle<'_>, range: PhysRange) -> Result<()> {
        self.check_handle(trans)?;
        self.alloc
            .free_reserved_extent(trans.cx(), range.start, range.len, false)
    }

    /// Queue creation of the data extent backing `range`, referenced by
    /// `(root, inode, offset)`.
    pub fn alloc_reserved_file_extent(
        &self,
        trans: &TransHandle<'_>,
        root: u64,
        inode: u64,
        offset: u64,
        range: PhysRange,
    ) -> Result<()> {
        self.check_handle(trans)?;
        let req = DelayedRef::data(RefAction::AddExtent, range.start, range.len, 0, root, inode, offset)
            .with_owning_root(root);
        self.delayed.add_data_ref(req, range.len)
    }

    /// Reserve and queue a data extent in one step.
    pub fn alloc_data_extent(
        &self,
        trans: &TransHandle<'_>,
        root: u64,
        inode: u64,
        offset: u64,
        num_bytes: u64,
    ) -> Result<PhysRange> {
        let found = self.reserve_extent(trans, &AllocRequest::data(num_bytes))?;
        let range = found.range();
        if let Err(err) = self.alloc_reserved_file_extent(trans, root, inode, offset, range) {
            self.alloc
                .free_reserved_extent(trans.cx(), range.start, range.len, false)?;
            return Err(err);
        }
        trace!(root, inode, offset, start = range.start, len = range.len, "alloc_data_extent");
        Ok(range)
    }

    /// Reserve a tree block and queue its extent item.
    ///
    /// A non-zero `parent` creates the block with a shared back-reference.
    pub fn alloc_tree_block(
        &self,
        trans: &TransHandle<'_>,
        root: u64,
        parent: u64,
        level: u8,
        first_key: BtrfsKey,
        hint: u64,
    ) -> Result<u64> {
        self.check_handle(trans)?;
        let nodesize = u64::from(self.options.nodesize);
        let req = AllocRequest::metadata(nodesize).with_hint(hint);
        let found = match &self.split_pool {
            Some(pool) => {
                let alloc = Arc::clone(&self.alloc);
                let cx = trans.cx().clone();
                pool.run(ReclaimFlags::NOFS, move |flags| {
                    trace!(?flags, "split_alloc_worker");
                    alloc.reserve_extent(&cx, &req)
                })?
            }
            None => self.alloc.reserve_extent(trans.cx(), &req)?,
        };
        let bytenr = found.start;
        let mut extent_op = ExtentOp::default();
        if !self.options.skinny_metadata {
            extent_op.merge(&ExtentOp::set_key(first_key));
        }
        if parent != 0 {
            extent_op.merge(&ExtentOp::set_flags(BLOCK_FLAG_FULL_BACKREF));
        }
        let extent_op = (!extent_op.is_noop()).then_some(extent_op);
        let add = DelayedRef::tree(RefAction::AddExtent, bytenr, nodesize, parent, root, level);
        if let Err(err) = self.delayed.add_tree_ref(add, extent_op) {
            self.alloc
                .free_reserved_extent(trans.cx(), bytenr, nodesize, false)?;
            return Err(err);
        }
        self.trans.lock().new_blocks.insert(bytenr);
        trace!(bytenr, root, parent, level, "alloc_tree_block");
        Ok(bytenr)
    }

    /// Drop `root`'s reference to `block`.
    ///
    /// When this was the last reference to a block created and never
    /// committed in this transaction, the queued insertion is cancelled and
    /// the space returns at once.
    pub fn free_tree_block(
        &self,
        trans: &TransHandle<'_>,
        root: u64,
        block: &TreeBlock,
        parent: u64,
        last_ref: bool,
    ) -> Result<()> {
        self.check_handle(trans)?;
        let nodesize = u64::from(self.options.nodesize);
        let drop = DelayedRef::tree(RefAction::DropRef, block.bytenr, nodesize, parent, root, block.level);
        self.delayed.add_tree_ref(drop, None)?;
        if !last_ref || block.generation != trans.generation() {
            return Ok(());
        }
        if !self.delayed.check_ref_cleanup(block.bytenr) {
            return Ok(());
        }
        if block.is_written() {
            self.alloc.pin_extent(block.bytenr, nodesize, true)?;
            debug!(bytenr = block.bytenr, "free_tree_block_pinned");
            return Ok(());
        }
        self.alloc
            .free_reserved_extent(trans.cx(), block.bytenr, nodesize, false)?;
        self.blocks.remove(block.bytenr);
        self.trans.lock().new_blocks.remove(&block.bytenr);
        debug!(bytenr = block.bytenr, "free_tree_block_reused");
        Ok(())
    }

    pub fn read_tree_block(&self, bytenr: u64, check: &BlockCheck) -> Result<TreeBlock> {
        self.blocks
            .read(bytenr, check)
            .inspect_err(|err| self.note_error(err))
    }

    // ── Lookups ─────────────────────────────────────────────────────────────

    /// Reference count and flags of an extent, committed state plus
    /// whatever is queued for it.
    ///
    /// The committed item and the queued head are read as one consistent
    /// pair: a head being drained is waited for, and the lookup restarts
    /// when the items moved underneath it.
    pub fn lookup_extent_info(&self, target: ExtentTarget) -> Result<ExtentInfo> {
        loop {
            let version = self.items.version();
            let committed = self
                .extents
                .lookup_extent(target)
                .inspect_err(|err| self.note_error(err))?;
            let (mut refs, mut flags, mut owner_root) = match &committed {
                Some(record) => (
                    i64::try_from(record.item.refs).unwrap_or(i64::MAX),
                    record.item.flags,
                    record.item.owner_root().unwrap_or(0),
                ),
                None => (0, 0, 0),
            };
            if let Some(head) = self.delayed.find_head(target.bytenr) {
                match head.try_peek() {
                    Ok(peek) => {
                        refs += peek.view.ref_mod;
                        if let Some(op) = peek.view.extent_op {
                            if op.update_flags {
                                flags |= op.flags_to_set;
                            }
                        }
                        if owner_root == 0 {
                            owner_root = peek.view.owning_root;
                        }
                    }
                    Err(FxtError::Busy) => {
                        head.wait_idle();
                        continue;
                    }
                    Err(FxtError::Again) => continue,
                    Err(err) => return Err(err),
                }
            }
            if self.items.version() != version {
                continue;
            }
            let refs = u64::try_from(refs).map_err(|_| {
                let err = FxtError::corruption(target.bytenr, format!("reference count {refs} below zero"));
                self.note_error(&err);
                err
            })?;
            return Ok(ExtentInfo {
                refs,
                flags,
                owner_root,
            });
        }
    }

    /// Whether the tree-block reference `(bytenr, parent, root)` survives,
    /// counting queued changes.
    pub fn tree_ref_exists(&self, bytenr: u64, parent: u64, root: u64, level: u8) -> Result<bool> {
        let id = RefIdentity::new(false, parent, root, u64::from(level), 0);
        let target = ExtentTarget::tree_block(bytenr, u64::from(self.options.nodesize), level);
        loop {
            let version = self.items.version();
            let mut count: i64 = match self.extents.lookup_extent(target)? {
                Some(record) => self
                    .extents
                    .backrefs(&record)?
                    .iter()
                    .filter(|backref| backref.id == id)
                    .map(|backref| i64::try_from(backref.count).unwrap_or(i64::MAX))
                    .sum(),
                None => 0,
            };
            if let Some(head) = self.delayed.find_head(bytenr) {
                match head.try_peek() {
                    Ok(peek) => {
                        count += peek
                            .nodes
                            .iter()
                            .filter(|node| ref_identity(node.kind) == id)
                            .map(RefNode::delta)
                            .sum::<i64>();
                    }
                    Err(FxtError::Busy) => {
                        head.wait_idle();
                        continue;
                    }
                    Err(FxtError::Again) => continue,
                    Err(err) => return Err(err),
                }
            }
            if self.items.version() != version {
                continue;
            }
            return Ok(count > 0);
        }
    }

    /// Whether anything besides `(root, inode, offset)` references the data
    /// extent at `bytenr`, committed or queued.
    pub fn cross_ref_exists(
        &self,
        root: u64,
        inode: u64,
        offset: u64,
        bytenr: u64,
        strict: bool,
    ) -> Result<bool> {
        let root_ref = RootRef {
            objectid: root,
            last_snapshot: self
                .roots
                .lock()
                .get(&root)
                .map_or(0, |item| item.last_snapshot),
        };
        loop {
            let committed = self
                .extents
                .check_committed_ref(root_ref, inode, offset, bytenr, strict)
                .inspect_err(|err| self.note_error(err))?;
            if committed == CommittedRef::Shared {
                return Ok(true);
            }
            match self.queued_cross_ref(root, inode, offset, bytenr) {
                Ok(shared) => return Ok(shared),
                Err(FxtError::Again) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn queued_cross_ref(&self, root: u64, inode: u64, offset: u64, bytenr: u64) -> Result<bool> {
        let Some(head) = self.delayed.find_head(bytenr) else {
            return Ok(false);
        };
        let peek = match head.try_peek() {
            Ok(peek) => peek,
            Err(FxtError::Busy) => {
                head.wait_idle();
                return Err(FxtError::Again);
            }
            Err(err) => return Err(err),
        };
        let mine = RefKind::ExtentData {
            root,
            objectid: inode,
            offset,
        };
        Ok(peek.nodes.iter().any(|node| node.kind != mine))
    }

    // ── Discard and zones ───────────────────────────────────────────────────

    /// Discard a logical range through its chunk mapping.
    pub fn discard_extent(&self, cx: &Cx, start: u64, len: u64) -> Result<u64> {
        self.state.check_writable()?;
        self.alloc.discard_extent(cx, start, len)
    }

    /// Discard a physical range of one device, skipping superblock copies.
    pub fn discard_device(&self, cx: &Cx, devid: u64, start: u64, len: u64) -> Result<u64> {
        self.state.check_writable()?;
        let dev = self
            .alloc
            .volumes()
            .device(DeviceId(devid))
            .ok_or_else(|| FxtError::NotFound(format!("device {devid}")))?;
        if !dev.is_writable() {
            return Err(FxtError::ReadOnly);
        }
        issue_discard(cx, dev.as_ref(), start, len, self.options.max_discard_chunk_size)
    }

    /// Discard free space in `[start, start + len)` and on unallocated
    /// device areas.
    pub fn trim_fs(&self, cx: &Cx, start: u64, len: u64, min_len: u64) -> Result<TrimReport> {
        self.state.check_writable()?;
        let report = self.alloc.trim_fs(cx, start, len, min_len);
        info!(
            trimmed = report.trimmed,
            bg_failed = report.bg_failed,
            dev_failed = report.dev_failed,
            "trim_fs"
        );
        Ok(report)
    }

    /// Reset a fully-unused zoned group so it can be written from the start.
    pub fn reclaim_zoned_group(&self, cx: &Cx, group_start: u64) -> Result<u64> {
        self.state.check_writable()?;
        self.alloc.reclaim_zoned_group(cx, group_start)
    }
}

/// The queued request for one child reference.
pub(crate) fn block_ref_request(action: RefAction, block_ref: &BlockRef) -> Result<DelayedRef> {
    if block_ref.is_data {
        return Ok(DelayedRef::data(
            action,
            block_ref.bytenr,
            block_ref.num_bytes,
            block_ref.parent,
            block_ref.root,
            block_ref.owner,
            block_ref.offset,
        ));
    }
    let level = u8::try_from(block_ref.owner)
        .map_err(|_| FxtError::corruption(block_ref.bytenr, "child level out of range"))?;
    Ok(DelayedRef::tree(
        action,
        block_ref.bytenr,
        block_ref.num_bytes,
        block_ref.parent,
        block_ref.root,
        level,
    ))
}
