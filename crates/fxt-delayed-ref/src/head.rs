//! Per-extent aggregation of queued changes.
//!
//! A head owns every queued node for one extent, plus the extent-wide state
//! the nodes share: the pending item creation, the pending flag/key update,
//! and the running reference delta. `state` is the head lock; `processing`
//! inside it marks the head as owned by a drain worker.

use crate::node::{Fold, NodeKey, RefNode, fold_into};
use fxt_error::{FxtError, Result};
use fxt_types::ExtentOp;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of queueing one node on a head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeInsert {
    /// Stored as a new node.
    Inserted,
    /// Folded into a node with the same key.
    Merged,
    /// Cancelled a node with the same key; that node is gone.
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct HeadState {
    pub(crate) num_bytes: u64,
    pub(crate) owning_root: u64,
    /// Uncompressed length charged when the data extent was reserved.
    pub(crate) ram_bytes: u64,
    /// Net delta of the nodes still queued.
    pub(crate) ref_mod: i64,
    /// Net delta of every change ever queued on this head.
    pub(crate) total_ref_mod: i64,
    pub(crate) must_insert_reserved: bool,
    pub(crate) extent_op: Option<ExtentOp>,
    pub(crate) processing: bool,
    /// Unlinked from the queue; lookups that raced with removal retry.
    pub(crate) removed: bool,
    pub(crate) nodes: BTreeMap<NodeKey, RefNode>,
}

impl HeadState {
    pub(crate) fn new(num_bytes: u64, owning_root: u64) -> Self {
        Self {
            num_bytes,
            owning_root,
            ram_bytes: 0,
            ref_mod: 0,
            total_ref_mod: 0,
            must_insert_reserved: false,
            extent_op: None,
            processing: false,
            removed: false,
            nodes: BTreeMap::new(),
        }
    }

    pub(crate) fn insert_node(&mut self, node: RefNode) -> NodeInsert {
        let key = node.key();
        let Some(existing) = self.nodes.get_mut(&key) else {
            self.nodes.insert(key, node);
            return NodeInsert::Inserted;
        };
        match fold_into(existing, &node) {
            Fold::Merged => NodeInsert::Merged,
            Fold::Cancelled => {
                self.nodes.remove(&key);
                NodeInsert::Cancelled
            }
        }
    }

    /// Fold nodes of equal identity but different sequence numbers.
    ///
    /// Nodes at or above `barrier` are left alone: a walker may still need
    /// to observe them separately. Returns how many nodes disappeared.
    pub(crate) fn merge(&mut self, barrier: Option<u64>) -> usize {
        let eligible: Vec<NodeKey> = self
            .nodes
            .keys()
            .filter(|key| barrier.is_none_or(|lowest| key.seq < lowest))
            .copied()
            .collect();
        let mut removed = 0;
        let mut survivor: Option<NodeKey> = None;
        for key in eligible {
            let Some(keep) = survivor.filter(|keep| keep.kind == key.kind) else {
                survivor = Some(key);
                continue;
            };
            let Some(later) = self.nodes.remove(&key) else {
                continue;
            };
            removed += 1;
            let cancelled = self
                .nodes
                .get_mut(&keep)
                .is_some_and(|node| fold_into(node, &later) == Fold::Cancelled);
            if cancelled {
                self.nodes.remove(&keep);
                removed += 1;
                survivor = None;
            }
        }
        removed
    }

    /// Next node to apply, in drain order.
    pub(crate) fn next_node(&self) -> Option<RefNode> {
        self.nodes.values().min_by_key(|node| node.drain_order()).copied()
    }

    /// Take `node` off the head, crediting its delta back.
    pub(crate) fn take_node(&mut self, node: &RefNode) {
        self.nodes.remove(&node.key());
        self.ref_mod -= node.delta();
    }

    /// Undo [`HeadState::take_node`] after a failed apply.
    pub(crate) fn restore_node(&mut self, node: RefNode) -> NodeInsert {
        self.ref_mod += node.delta();
        self.insert_node(node)
    }
}

// ── Heads ───────────────────────────────────────────────────────────────────

/// All queued changes for the extent at `bytenr`.
#[derive(Debug)]
pub struct DelayedRefHead {
    bytenr: u64,
    is_data: bool,
    is_system: bool,
    state: Mutex<HeadState>,
    idle: Condvar,
}

/// Point-in-time copy of a head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeadView {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub is_data: bool,
    pub is_system: bool,
    pub owning_root: u64,
    pub ram_bytes: u64,
    pub ref_mod: i64,
    pub total_ref_mod: i64,
    pub must_insert_reserved: bool,
    pub extent_op: Option<ExtentOp>,
    pub processing: bool,
    pub queued: usize,
}

/// A head together with its queued nodes, read while no worker owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadPeek {
    pub view: HeadView,
    pub nodes: Vec<RefNode>,
}

impl DelayedRefHead {
    pub(crate) fn new(bytenr: u64, is_data: bool, is_system: bool, state: HeadState) -> Self {
        Self {
            bytenr,
            is_data,
            is_system,
            state: Mutex::new(state),
            idle: Condvar::new(),
        }
    }

    #[must_use]
    pub fn bytenr(&self) -> u64 {
        self.bytenr
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        self.is_data
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.is_system
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HeadState> {
        self.state.lock()
    }

    pub(crate) fn view_locked(&self, state: &HeadState) -> HeadView {
        HeadView {
            bytenr: self.bytenr,
            num_bytes: state.num_bytes,
            is_data: self.is_data,
            is_system: self.is_system,
            owning_root: state.owning_root,
            ram_bytes: state.ram_bytes,
            ref_mod: state.ref_mod,
            total_ref_mod: state.total_ref_mod,
            must_insert_reserved: state.must_insert_reserved,
            extent_op: state.extent_op,
            processing: state.processing,
            queued: state.nodes.len(),
        }
    }

    #[must_use]
    pub fn view(&self) -> HeadView {
        let state = self.state.lock();
        self.view_locked(&state)
    }

    /// Read the head unless a drain worker owns it.
    ///
    /// Returns [`FxtError::Busy`] while the head is being processed and
    /// [`FxtError::Again`] once it has left the queue.
    pub fn try_peek(&self) -> Result<HeadPeek> {
        let state = self.state.lock();
        if state.removed {
            return Err(FxtError::Again);
        }
        if state.processing {
            return Err(FxtError::Busy);
        }
        Ok(HeadPeek {
            view: self.view_locked(&state),
            nodes: state.nodes.values().copied().collect(),
        })
    }

    /// Block until no worker owns the head, or it leaves the queue.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.processing && !state.removed {
            self.idle.wait(&mut state);
        }
    }

    pub(crate) fn notify_idle(&self) {
        self.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{DelayedRef, RefAction};
    use fxt_types::FS_TREE_OBJECTID;

    fn data(action: RefAction, seq: u64) -> RefNode {
        weighted(action, seq, 1)
    }

    fn weighted(action: RefAction, seq: u64, count: u32) -> RefNode {
        DelayedRef::data(action, 1 << 20, 4096, 0, FS_TREE_OBJECTID, 257, 0)
            .with_count(count)
            .to_node(seq)
    }

    #[test]
    fn same_key_nodes_fold_at_insert() {
        let mut state = HeadState::new(4096, FS_TREE_OBJECTID);
        assert_eq!(state.insert_node(data(RefAction::AddRef, 0)), NodeInsert::Inserted);
        assert_eq!(state.insert_node(data(RefAction::AddRef, 0)), NodeInsert::Merged);
        assert_eq!(
            state.insert_node(weighted(RefAction::DropRef, 0, 2)),
            NodeInsert::Cancelled
        );
        assert!(state.nodes.is_empty());
    }

    #[test]
    fn merge_respects_the_sequence_barrier() {
        let mut state = HeadState::new(4096, FS_TREE_OBJECTID);
        state.insert_node(data(RefAction::AddRef, 3));
        state.insert_node(data(RefAction::DropRef, 7));
        assert_eq!(state.merge(Some(5)), 0);
        assert_eq!(state.nodes.len(), 2);
        assert_eq!(state.merge(None), 2);
        assert!(state.nodes.is_empty());
    }

    #[test]
    fn peek_reports_busy_while_processing() {
        let head = DelayedRefHead::new(1 << 20, true, false, HeadState::new(4096, 5));
        head.lock().processing = true;
        assert!(matches!(head.try_peek(), Err(FxtError::Busy)));
        head.lock().processing = false;
        assert!(head.try_peek().is_ok());
        head.lock().removed = true;
        assert!(matches!(head.try_peek(), Err(FxtError::Again)));
    }
}
