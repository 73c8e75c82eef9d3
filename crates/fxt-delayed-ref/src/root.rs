//! The delayed-ref queue of one transaction.
//!
//! Heads live in an arena and are indexed by bytenr. The table lock guards
//! the index and the queue-wide counters; each head has its own lock, always
//! taken after the table lock. A drain worker owns a head from
//! [`DelayedRefRoot::select_head`] until the head is drained or handed back.

use crate::head::{DelayedRefHead, HeadState, HeadView, NodeInsert};
use crate::node::{DelayedRef, RefAction, RefNode};
use crate::tree_mod_log::TreeModLog;
use asupersync::Cx;
use fxt_error::{FxtError, Result};
use fxt_types::{CHUNK_TREE_OBJECTID, ExtentOp};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Applies drained changes to the extent tree.
pub trait RefRunner {
    /// Apply a pending flag/key update to an extent whose item exists.
    fn run_extent_op(&mut self, head: &HeadView, op: &ExtentOp) -> Result<()>;

    /// Apply one node. For [`RefAction::AddExtent`], `op` is the update to
    /// fold into the new item.
    fn run_ref(&mut self, head: &HeadView, node: &RefNode, op: Option<&ExtentOp>) -> Result<()>;

    /// The head drained without creating its reserved extent.
    fn pin_reserved(&mut self, head: &HeadView) -> Result<()>;
}

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| FxtError::Cancelled)
}

/// Counters from one [`DelayedRefRoot::run`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub heads: u64,
    pub refs: u64,
    pub extent_ops: u64,
    pub bytes: u64,
    /// Heads handed back because a tree-mod-log reader still needs them.
    pub deferred: u64,
    /// Heads whose reserved extent was never created and got pinned.
    pub pinned: u64,
}

/// What an abort threw away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DestroyReport {
    pub heads: u64,
    pub nodes: u64,
    pub pinned: u64,
    pub pinned_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelayedRefsSnapshot {
    pub heads: Vec<HeadView>,
    pub num_heads: usize,
    pub num_heads_ready: u64,
    pub num_entries: u64,
    pub pending_csums: u64,
    pub rsv_units: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadRun {
    Done,
    Deferred,
}

enum Step {
    ExtentOp(ExtentOp),
    Node {
        node: RefNode,
        op: Option<ExtentOp>,
        creates: bool,
    },
    Blocked(u64),
    Drained,
}

/// Extent-wide part of a queued change.
struct HeadUpdate {
    num_bytes: u64,
    owning_root: u64,
    ram_bytes: u64,
    delta: i64,
    must_insert: bool,
    extent_op: Option<ExtentOp>,
}

// ── Table ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Table {
    index: BTreeMap<u64, usize>,
    arena: Vec<Option<Arc<DelayedRefHead>>>,
    free_slots: Vec<usize>,
    num_heads_ready: u64,
    /// Bytes of data extents whose checksums will be deleted.
    pending_csums: u64,
    /// Where the next selection starts, so workers spread over the queue.
    run_start: u64,
}

impl Table {
    fn get(&self, bytenr: u64) -> Option<&Arc<DelayedRefHead>> {
        let slot = *self.index.get(&bytenr)?;
        self.arena.get(slot)?.as_ref()
    }

    fn link(&mut self, head: Arc<DelayedRefHead>) {
        let bytenr = head.bytenr();
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.arena[slot] = Some(head);
            slot
        } else {
            self.arena.push(Some(head));
            self.arena.len() - 1
        };
        self.index.insert(bytenr, slot);
    }

    fn unlink(&mut self, bytenr: u64) {
        if let Some(slot) = self.index.remove(&bytenr) {
            self.arena[slot] = None;
            self.free_slots.push(slot);
        }
    }

    fn first_idle(&self, from: u64) -> Option<Arc<DelayedRefHead>> {
        self.index
            .range(from..)
            .filter_map(|(_, &slot)| self.arena.get(slot)?.clone())
            .find(|head| !head.lock().processing)
    }

    fn heads(&self) -> impl Iterator<Item = &Arc<DelayedRefHead>> {
        self.index
            .values()
            .filter_map(|&slot| self.arena.get(slot)?.as_ref())
    }

    fn adjust_pending_csums(&mut self, head: &DelayedRefHead, old_total: i64, state: &HeadState) {
        if !head.is_data() {
            return;
        }
        if old_total >= 0 && state.total_ref_mod < 0 {
            self.pending_csums += state.num_bytes;
        } else if old_total < 0 && state.total_ref_mod >= 0 {
            self.pending_csums = self.pending_csums.saturating_sub(state.num_bytes);
        }
    }
}

// ── Root ────────────────────────────────────────────────────────────────────

/// Per-transaction queue of reference changes, drained before commit.
#[derive(Debug)]
pub struct DelayedRefRoot {
    tree_mod_log: Arc<TreeModLog>,
    table: Mutex<Table>,
    num_entries: AtomicU64,
    /// One unit per live head and per live node.
    rsv_units: AtomicU64,
}

impl DelayedRefRoot {
    #[must_use]
    pub fn new(tree_mod_log: Arc<TreeModLog>) -> Self {
        Self {
            tree_mod_log,
            table: Mutex::new(Table::default()),
            num_entries: AtomicU64::new(0),
            rsv_units: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn tree_mod_log(&self) -> &Arc<TreeModLog> {
        &self.tree_mod_log
    }

    // ── Queueing ────────────────────────────────────────────────────────────

    /// Queue a tree block change, optionally with a flag/key update.
    pub fn add_tree_ref(&self, req: DelayedRef, extent_op: Option<ExtentOp>) -> Result<()> {
        if req.is_data {
            return Err(FxtError::InvalidArgument(
                "data reference queued as a tree reference".to_owned(),
            ));
        }
        self.queue(req, extent_op, 0)
    }

    /// Queue a data extent change; `ram_bytes` is the reserved length.
    pub fn add_data_ref(&self, req: DelayedRef, ram_bytes: u64) -> Result<()> {
        if !req.is_data {
            return Err(FxtError::InvalidArgument(
                "tree reference queued as a data reference".to_owned(),
            ));
        }
        self.queue(req, None, ram_bytes)
    }

    /// Queue a flag/key update with no reference change.
    pub fn add_extent_op(&self, bytenr: u64, num_bytes: u64, op: ExtentOp) -> Result<()> {
        if op.is_noop() {
            return Ok(());
        }
        let update = HeadUpdate {
            num_bytes,
            owning_root: 0,
            ram_bytes: 0,
            delta: 0,
            must_insert: false,
            extent_op: Some(op),
        };
        self.update_head(bytenr, false, false, update, None)?;
        trace!(bytenr, flags = op.flags_to_set, "queued extent op");
        Ok(())
    }

    fn queue(&self, req: DelayedRef, extent_op: Option<ExtentOp>, ram_bytes: u64) -> Result<()> {
        if req.count == 0 || req.num_bytes == 0 {
            return Err(FxtError::InvalidArgument(format!(
                "empty delayed ref at bytenr {}",
                req.bytenr
            )));
        }
        let seq = if req.is_sequenced() {
            self.tree_mod_log.current_seq()
        } else {
            0
        };
        let node = req.to_node(seq);
        let update = HeadUpdate {
            num_bytes: req.num_bytes,
            owning_root: req.owning_root,
            ram_bytes,
            delta: node.delta(),
            must_insert: req.action == RefAction::AddExtent,
            extent_op: extent_op.filter(|op| !op.is_noop()),
        };
        let is_system = !req.is_data && req.ref_root == CHUNK_TREE_OBJECTID;
        let outcome = self.update_head(req.bytenr, req.is_data, is_system, update, Some(node))?;
        trace!(
            bytenr = req.bytenr,
            action = ?req.action,
            kind = ?node.kind,
            count = req.count,
            seq,
            outcome = ?outcome,
            "queued delayed ref"
        );
        Ok(())
    }

    fn update_head(
        &self,
        bytenr: u64,
        is_data: bool,
        is_system: bool,
        update: HeadUpdate,
        node: Option<RefNode>,
    ) -> Result<Option<NodeInsert>> {
        let mut table = self.table.lock();
        let head = if let Some(head) = table.get(bytenr) {
            Arc::clone(head)
        } else {
            let state = HeadState::new(update.num_bytes, update.owning_root);
            let head = Arc::new(DelayedRefHead::new(bytenr, is_data, is_system, state));
            table.link(Arc::clone(&head));
            table.num_heads_ready += 1;
            self.rsv_units.fetch_add(1, Ordering::Relaxed);
            head
        };
        // Flag-only updates do not know the extent kind.
        if node.is_some() && head.is_data() != is_data {
            return Err(FxtError::corruption(
                bytenr,
                "delayed ref kind differs from its queued head",
            ));
        }

        let mut state = head.lock();
        let old_total = state.total_ref_mod;
        if state.owning_root == 0 {
            state.owning_root = update.owning_root;
        }
        if update.must_insert {
            // Freed and reallocated inside the transaction: the item has to
            // be created again.
            state.must_insert_reserved = true;
            state.owning_root = update.owning_root;
            state.num_bytes = update.num_bytes;
        }
        if update.ram_bytes != 0 {
            state.ram_bytes = update.ram_bytes;
        }
        if let Some(op) = update.extent_op {
            match state.extent_op.as_mut() {
                Some(pending) => pending.merge(&op),
                None => state.extent_op = Some(op),
            }
        }
        state.ref_mod += update.delta;
        state.total_ref_mod += update.delta;
        table.adjust_pending_csums(&head, old_total, &state);

        let outcome = node.map(|node| state.insert_node(node));
        match outcome {
            Some(NodeInsert::Inserted) => {
                self.num_entries.fetch_add(1, Ordering::Relaxed);
                self.rsv_units.fetch_add(1, Ordering::Relaxed);
            }
            Some(NodeInsert::Cancelled) => self.forget_nodes(1),
            Some(NodeInsert::Merged) | None => {}
        }
        Ok(outcome)
    }

    fn forget_nodes(&self, count: usize) {
        let count = count as u64;
        if count == 0 {
            return;
        }
        self.num_entries.fetch_sub(count, Ordering::Relaxed);
        self.rsv_units.fetch_sub(count, Ordering::Relaxed);
    }

    // ── Selection ───────────────────────────────────────────────────────────

    /// Claim the next idle head, scanning upward from the last claim.
    #[must_use]
    pub fn select_head(&self) -> Option<Arc<DelayedRefHead>> {
        let mut table = self.table.lock();
        let start = table.run_start;
        let head = table
            .first_idle(start)
            .or_else(|| if start > 0 { table.first_idle(0) } else { None })?;
        let end = {
            let mut state = head.lock();
            state.processing = true;
            head.bytenr().saturating_add(state.num_bytes)
        };
        table.num_heads_ready = table.num_heads_ready.saturating_sub(1);
        table.run_start = end;
        Some(head)
    }

    /// Hand a claimed head back to the queue.
    pub fn unselect_head(&self, head: &DelayedRefHead) {
        {
            let mut table = self.table.lock();
            let mut state = head.lock();
            if state.processing && !state.removed {
                table.num_heads_ready += 1;
            }
            state.processing = false;
        }
        head.notify_idle();
    }

    // ── Draining ────────────────────────────────────────────────────────────

    /// Drain heads in bytenr order until `min_bytes` of extents are done.
    ///
    /// `0` drains the heads that are ready when the call starts;
    /// `u64::MAX` drains everything, including heads queued meanwhile.
    /// Heads held back by a tree-mod-log reader are counted in
    /// [`RunStats::deferred`] and left queued.
    ///
    /// `cx` is checked before each head and between the nodes of a head. A
    /// cancelled drain returns `Cancelled` with every unapplied node still
    /// queued and no head left claimed.
    pub fn run(&self, cx: &Cx, runner: &mut dyn RefRunner, min_bytes: u64) -> Result<RunStats> {
        let (target, max_heads) = if min_bytes == 0 {
            (u64::MAX, self.num_heads_ready())
        } else {
            (min_bytes, u64::MAX)
        };
        let mut stats = RunStats::default();
        let mut deferred_in_a_row = 0_u64;
        while stats.bytes < target && stats.heads < max_heads {
            cx_checkpoint(cx)?;
            let Some(head) = self.select_head() else {
                break;
            };
            match self.run_head(cx, &head, runner, &mut stats)? {
                HeadRun::Done => deferred_in_a_row = 0,
                HeadRun::Deferred => {
                    stats.deferred += 1;
                    deferred_in_a_row += 1;
                    if deferred_in_a_row >= self.num_heads() as u64 {
                        break;
                    }
                }
            }
        }
        debug!(
            target: "fxt::delayed_ref",
            heads = stats.heads,
            refs = stats.refs,
            extent_ops = stats.extent_ops,
            bytes = stats.bytes,
            deferred = stats.deferred,
            pinned = stats.pinned,
            remaining = self.num_heads(),
            "delayed_refs_run"
        );
        Ok(stats)
    }

    fn run_head(
        &self,
        cx: &Cx,
        head: &Arc<DelayedRefHead>,
        runner: &mut dyn RefRunner,
        stats: &mut RunStats,
    ) -> Result<HeadRun> {
        loop {
            let barrier = self.tree_mod_log.lowest_seq();
            let (view, step) = {
                let mut state = head.lock();
                let merged = state.merge(barrier);
                self.forget_nodes(merged);
                let step = next_step(&mut state, barrier);
                (head.view_locked(&state), step)
            };
            match step {
                Step::ExtentOp(op) => {
                    if let Err(err) =
                        cx_checkpoint(cx).and_then(|()| runner.run_extent_op(&view, &op))
                    {
                        restore_extent_op(&mut head.lock(), op);
                        self.unselect_head(head);
                        return Err(err);
                    }
                    stats.extent_ops += 1;
                }
                Step::Node { node, op, creates } => {
                    if let Err(err) =
                        cx_checkpoint(cx).and_then(|()| runner.run_ref(&view, &node, op.as_ref()))
                    {
                        self.restore_node(head, node, op, creates);
                        self.unselect_head(head);
                        return Err(err);
                    }
                    self.forget_nodes(1);
                    stats.refs += 1;
                }
                Step::Blocked(seq) => {
                    trace!(bytenr = head.bytenr(), seq, "delayed ref held back by reader");
                    self.unselect_head(head);
                    return Ok(HeadRun::Deferred);
                }
                Step::Drained => {
                    if self.cleanup_head(head, runner, stats)? {
                        return Ok(HeadRun::Done);
                    }
                }
            }
        }
    }

    fn restore_node(
        &self,
        head: &DelayedRefHead,
        node: RefNode,
        op: Option<ExtentOp>,
        creates: bool,
    ) {
        let mut state = head.lock();
        if creates {
            state.must_insert_reserved = true;
        }
        if let Some(op) = op {
            restore_extent_op(&mut state, op);
        }
        match state.restore_node(node) {
            NodeInsert::Inserted => {}
            NodeInsert::Merged => self.forget_nodes(1),
            NodeInsert::Cancelled => self.forget_nodes(2),
        }
    }

    /// Unlink a drained head. Returns false if work arrived meanwhile.
    fn cleanup_head(
        &self,
        head: &DelayedRefHead,
        runner: &mut dyn RefRunner,
        stats: &mut RunStats,
    ) -> Result<bool> {
        let view = {
            let mut table = self.table.lock();
            let mut state = head.lock();
            if !state.nodes.is_empty() || (state.extent_op.is_some() && !state.must_insert_reserved)
            {
                return Ok(false);
            }
            // An update waiting on an item that was never created.
            state.extent_op = None;
            if head.is_data() && state.total_ref_mod < 0 {
                table.pending_csums = table.pending_csums.saturating_sub(state.num_bytes);
            }
            state.removed = true;
            state.processing = false;
            let view = head.view_locked(&state);
            drop(state);
            table.unlink(head.bytenr());
            view
        };
        self.rsv_units.fetch_sub(1, Ordering::Relaxed);
        head.notify_idle();
        stats.heads += 1;
        stats.bytes += view.num_bytes;
        if view.must_insert_reserved {
            debug!(
                bytenr = view.bytenr,
                num_bytes = view.num_bytes,
                "reserved extent cancelled before creation, pinning"
            );
            runner.pin_reserved(&view)?;
            stats.pinned += 1;
        }
        Ok(true)
    }

    // ── Cleanup ─────────────────────────────────────────────────────────────

    /// Drop an idle head whose changes cancelled out.
    ///
    /// Returns true when the head was removed while its extent was still
    /// only reserved: the caller then owns the range and may hand it back
    /// to free space directly.
    pub fn check_ref_cleanup(&self, bytenr: u64) -> bool {
        let (head, must_insert) = {
            let mut table = self.table.lock();
            let Some(head) = table.get(bytenr).cloned() else {
                return false;
            };
            let mut state = head.lock();
            if !state.nodes.is_empty() || state.processing {
                return false;
            }
            if state.extent_op.is_some() && !state.must_insert_reserved {
                return false;
            }
            state.extent_op = None;
            if head.is_data() && state.total_ref_mod < 0 {
                table.pending_csums = table.pending_csums.saturating_sub(state.num_bytes);
            }
            state.removed = true;
            let must_insert = state.must_insert_reserved;
            drop(state);
            table.unlink(bytenr);
            table.num_heads_ready = table.num_heads_ready.saturating_sub(1);
            (head, must_insert)
        };
        self.rsv_units.fetch_sub(1, Ordering::Relaxed);
        head.notify_idle();
        trace!(bytenr, must_insert, "idle delayed ref head removed");
        must_insert
    }

    /// Discard every queued change after a transaction abort.
    ///
    /// Heads still holding an uncreated reservation are passed to `pin`;
    /// their ranges must never return to free space.
    pub fn destroy(&self, mut pin: impl FnMut(&HeadView) -> Result<()>) -> DestroyReport {
        let heads: Vec<Arc<DelayedRefHead>> = {
            let mut table = self.table.lock();
            let heads = table.arena.drain(..).flatten().collect();
            table.index.clear();
            table.free_slots.clear();
            table.num_heads_ready = 0;
            table.pending_csums = 0;
            heads
        };
        let mut report = DestroyReport::default();
        for head in heads {
            let (view, nodes) = {
                let mut state = head.lock();
                let nodes = state.nodes.len();
                state.nodes.clear();
                state.extent_op = None;
                state.removed = true;
                state.processing = false;
                (head.view_locked(&state), nodes)
            };
            head.notify_idle();
            self.forget_nodes(nodes);
            self.rsv_units.fetch_sub(1, Ordering::Relaxed);
            report.heads += 1;
            report.nodes += nodes as u64;
            if view.must_insert_reserved {
                if let Err(err) = pin(&view) {
                    warn!(bytenr = view.bytenr, error = %err, "failed to pin aborted reservation");
                    continue;
                }
                report.pinned += 1;
                report.pinned_bytes += view.num_bytes;
            }
        }
        if report.heads > 0 {
            warn!(
                target: "fxt::delayed_ref",
                heads = report.heads,
                nodes = report.nodes,
                pinned = report.pinned,
                pinned_bytes = report.pinned_bytes,
                "delayed_refs_destroyed"
            );
        }
        report
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    #[must_use]
    pub fn find_head(&self, bytenr: u64) -> Option<Arc<DelayedRefHead>> {
        self.table.lock().get(bytenr).cloned()
    }

    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.table.lock().index.len()
    }

    #[must_use]
    pub fn num_heads_ready(&self) -> u64 {
        self.table.lock().num_heads_ready
    }

    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pending_csums(&self) -> u64 {
        self.table.lock().pending_csums
    }

    #[must_use]
    pub fn rsv_units(&self) -> u64 {
        self.rsv_units.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().index.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> DelayedRefsSnapshot {
        let table = self.table.lock();
        DelayedRefsSnapshot {
            heads: table.heads().map(|head| head.view()).collect(),
            num_heads: table.index.len(),
            num_heads_ready: table.num_heads_ready,
            num_entries: self.num_entries(),
            pending_csums: table.pending_csums,
            rsv_units: self.rsv_units(),
        }
    }
}

/// Decide the next unit of work on a claimed head.
///
/// A pending update goes first when the item exists. Nodes follow in drain
/// order; a node newer than a live reader stops the whole head.
fn next_step(state: &mut HeadState, barrier: Option<u64>) -> Step {
    if !state.must_insert_reserved {
        if let Some(op) = state.extent_op.take() {
            return Step::ExtentOp(op);
        }
    }
    let Some(node) = state.next_node() else {
        return Step::Drained;
    };
    if node.seq != 0 && barrier.is_some_and(|lowest| node.seq >= lowest) {
        return Step::Blocked(node.seq);
    }
    state.take_node(&node);
    let creates = node.action == RefAction::AddExtent;
    let op = if creates {
        state.must_insert_reserved = false;
        state.extent_op.take()
    } else {
        None
    };
    Step::Node { node, op, creates }
}

/// Put back an update that failed to apply, under any newer one.
fn restore_extent_op(state: &mut HeadState, mut op: ExtentOp) {
    if let Some(later) = state.extent_op.take() {
        op.merge(&later);
    }
    state.extent_op = Some(op);
}
