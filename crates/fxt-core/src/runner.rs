//! Applies drained delayed refs to the extent items.

use crate::engine::ExtentTree;
use fxt_delayed_ref::{HeadView, RefAction, RefKind, RefNode, RefRunner};
use fxt_error::{FxtError, Result};
use fxt_extent::{DropOutcome, ExtentRecord, ExtentTarget, NewExtent, RefIdentity};
use fxt_types::{BtrfsKey, ExtentOp, METADATA_ITEM_KEY};
use tracing::trace;

/// The back-reference a queued node adds or drops.
#[must_use]
pub fn ref_identity(kind: RefKind) -> RefIdentity {
    match kind {
        RefKind::TreeBlock { root } => RefIdentity::TreeBlock { root },
        RefKind::SharedBlock { parent } => RefIdentity::SharedBlock { parent },
        RefKind::ExtentData {
            root,
            objectid,
            offset,
        } => RefIdentity::ExtentData {
            root,
            objectid,
            offset,
        },
        RefKind::SharedData { parent } => RefIdentity::SharedData { parent },
    }
}

/// Where the item of `record` lives, for the update paths.
pub(crate) fn target_of(record: &ExtentRecord, nodesize: u64) -> Result<ExtentTarget> {
    let bytenr = record.key.objectid;
    if record.key.item_type == METADATA_ITEM_KEY {
        let level = u8::try_from(record.key.offset)
            .map_err(|_| FxtError::corruption(bytenr, "metadata item level out of range"))?;
        return Ok(ExtentTarget::tree_block(bytenr, nodesize, level));
    }
    Ok(match &record.item.tree_block {
        Some(info) => ExtentTarget::tree_block(bytenr, record.key.offset, info.level),
        None => ExtentTarget::data(bytenr, record.key.offset),
    })
}

pub(crate) struct ExtentRunner<'a> {
    tree: &'a ExtentTree,
    generation: u64,
}

impl<'a> ExtentRunner<'a> {
    pub(crate) fn new(tree: &'a ExtentTree, generation: u64) -> Self {
        Self { tree, generation }
    }

    /// Refuse to touch the tree once the filesystem has aborted.
    fn ensure_live(&self) -> Result<()> {
        match self.tree.state().aborted() {
            Some(errno) => Err(FxtError::Aborted { errno }),
            None => Ok(()),
        }
    }

    fn node_target(&self, head: &HeadView, node: &RefNode) -> Result<ExtentTarget> {
        if head.is_data {
            return Ok(ExtentTarget::data(head.bytenr, head.num_bytes));
        }
        let level = u8::try_from(node.owner)
            .map_err(|_| FxtError::corruption(head.bytenr, "tree ref level out of range"))?;
        Ok(ExtentTarget::tree_block(head.bytenr, head.num_bytes, level))
    }

    fn insert_reserved(&self, head: &HeadView, node: &RefNode, op: Option<&ExtentOp>) -> Result<()> {
        let target = self.node_target(head, node)?;
        let flags = op.filter(|op| op.update_flags).map_or(0, |op| op.flags_to_set);
        let first_key = op.and_then(|op| op.key).unwrap_or(BtrfsKey::MIN);
        let owner_root = (head.is_data && self.tree.options().simple_quota)
            .then_some(head.owning_root)
            .filter(|&root| root != 0);
        self.tree.extents().insert_extent(&NewExtent {
            target,
            generation: self.generation,
            flags,
            first_key,
            backref: ref_identity(node.kind),
            refs: node.ref_mod,
            owner_root,
        })?;
        self.tree
            .alloc()
            .update_block_group(head.bytenr, head.num_bytes, true)
    }
}

impl RefRunner for ExtentRunner<'_> {
    fn run_extent_op(&mut self, head: &HeadView, op: &ExtentOp) -> Result<()> {
        self.ensure_live()?;
        let record = self
            .tree
            .extents()
            .find_extent(head.bytenr)?
            .ok_or_else(|| FxtError::corruption(head.bytenr, "extent op for a missing extent"))?;
        let target = target_of(&record, u64::from(self.tree.options().nodesize))?;
        self.tree.extents().apply_extent_op(target, op)
    }

    fn run_ref(&mut self, head: &HeadView, node: &RefNode, op: Option<&ExtentOp>) -> Result<()> {
        self.ensure_live()?;
        trace!(
            bytenr = head.bytenr,
            action = ?node.action,
            kind = ?node.kind,
            ref_mod = node.ref_mod,
            "run_delayed_ref"
        );
        match node.action {
            RefAction::AddExtent => self.insert_reserved(head, node, op),
            RefAction::AddRef => {
                let target = self.node_target(head, node)?;
                self.tree
                    .extents()
                    .inc_extent_ref(target, ref_identity(node.kind), node.ref_mod, op)?;
                Ok(())
            }
            RefAction::DropRef => {
                let target = self.node_target(head, node)?;
                let outcome = self.tree.extents().free_extent(
                    target,
                    ref_identity(node.kind),
                    node.ref_mod,
                    op,
                )?;
                if let DropOutcome::Removed { .. } = outcome {
                    self.tree
                        .alloc()
                        .update_block_group(head.bytenr, head.num_bytes, false)?;
                    trace!(bytenr = head.bytenr, num_bytes = head.num_bytes, "extent removed, range pinned");
                }
                Ok(())
            }
        }
    }

    fn pin_reserved(&mut self, head: &HeadView) -> Result<()> {
        self.tree.alloc().pin_extent(head.bytenr, head.num_bytes, true)
    }
}
