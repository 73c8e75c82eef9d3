//! Subvolume roots: building trees, snapshotting them and dropping them.

use crate::engine::{ExtentTree, block_ref_request};
use crate::trans::TransHandle;
use fxt_btrfs::{
    BlockCheck, BlockRef, DropEnv, DropReport, DropStatus, ExtentInfo, LeafItem, NodePtr,
    RefChange, RootItem, TreeBlock, drop_snapshot,
};
use fxt_delayed_ref::RefAction;
use fxt_error::{FxtError, Result};
use fxt_extent::ExtentTarget;
use fxt_types::{BLOCK_FLAG_FULL_BACKREF, BTRFS_MAX_LEVEL, BtrfsKey, ExtentOp};
use tracing::{debug, info};

impl ExtentTree {
    #[must_use]
    pub fn root(&self, root_id: u64) -> Option<RootItem> {
        self.roots.lock().get(&root_id).copied()
    }

    #[must_use]
    pub fn roots(&self) -> Vec<RootItem> {
        self.roots.lock().values().copied().collect()
    }

    /// Roots whose drop has begun but not finished.
    #[must_use]
    pub fn dead_roots(&self) -> Vec<RootItem> {
        self.roots
            .lock()
            .values()
            .filter(|root| root.dead)
            .copied()
            .collect()
    }

    pub fn set_root(&self, trans: &TransHandle<'_>, root: RootItem) -> Result<()> {
        self.check_handle(trans)?;
        self.roots.lock().insert(root.root_id, root);
        Ok(())
    }

    // ── Building trees ──────────────────────────────────────────────────────

    /// Allocate and write a leaf owned by `owner`.
    ///
    /// File extent items in `items` are stored as given; the data extents
    /// they point at must be referenced by the caller.
    pub fn create_leaf(
        &self,
        trans: &TransHandle<'_>,
        owner: u64,
        items: Vec<LeafItem>,
    ) -> Result<TreeBlock> {
        let first_key = items.first().map_or(BtrfsKey::MIN, |item| item.key);
        let bytenr = self.alloc_tree_block(trans, owner, 0, 0, first_key, 0)?;
        let block = TreeBlock::leaf(bytenr, trans.generation(), owner, items);
        self.blocks.write(&block)?;
        Ok(block)
    }

    /// Allocate and write a node pointing at `children`.
    ///
    /// The children keep whatever references they already carry; a fresh
    /// child's queued insertion already names `owner`.
    pub fn create_node(
        &self,
        trans: &TransHandle<'_>,
        owner: u64,
        level: u8,
        children: &[&TreeBlock],
    ) -> Result<TreeBlock> {
        if level == 0 || level >= BTRFS_MAX_LEVEL {
            return Err(FxtError::InvalidArgument(format!(
                "node level {level} out of range"
            )));
        }
        if children.is_empty() {
            return Err(FxtError::InvalidArgument("node without children".to_owned()));
        }
        let mut ptrs = Vec::with_capacity(children.len());
        for child in children {
            if child.level + 1 != level {
                return Err(FxtError::InvalidArgument(format!(
                    "child {} at level {} under a level {level} node",
                    child.bytenr, child.level
                )));
            }
            ptrs.push(NodePtr {
                key: child.first_key().unwrap_or(BtrfsKey::MIN),
                blockptr: child.bytenr,
                generation: child.generation,
            });
        }
        let first_key = ptrs[0].key;
        let bytenr = self.alloc_tree_block(trans, owner, 0, level, first_key, 0)?;
        let block = TreeBlock::node(bytenr, trans.generation(), owner, level, ptrs);
        self.blocks.write(&block)?;
        Ok(block)
    }

    /// Register `top` as the root block of tree `root_id`.
    pub fn create_root(
        &self,
        trans: &TransHandle<'_>,
        root_id: u64,
        top: &TreeBlock,
    ) -> Result<RootItem> {
        self.check_handle(trans)?;
        let mut roots = self.roots.lock();
        if roots.contains_key(&root_id) {
            return Err(FxtError::Exists(format!("root {root_id}")));
        }
        let item = RootItem::new(root_id, top.bytenr, top.level, top.generation);
        roots.insert(root_id, item);
        debug!(root_id, bytenr = top.bytenr, level = top.level, "root_created");
        Ok(item)
    }

    // ── Snapshots ───────────────────────────────────────────────────────────

    /// Snapshot `src_id` as `new_id`.
    ///
    /// The root block is copied; everything below it becomes shared by one
    /// more reference from the copy.
    pub fn create_snapshot(
        &self,
        trans: &TransHandle<'_>,
        src_id: u64,
        new_id: u64,
    ) -> Result<RootItem> {
        self.check_handle(trans)?;
        let src = {
            let roots = self.roots.lock();
            if roots.contains_key(&new_id) {
                return Err(FxtError::Exists(format!("root {new_id}")));
            }
            roots
                .get(&src_id)
                .copied()
                .ok_or_else(|| FxtError::NotFound(format!("root {src_id}")))?
        };
        if src.dead {
            return Err(FxtError::InvalidArgument(format!(
                "root {src_id} is being dropped"
            )));
        }
        let top = self.read_tree_block(
            src.bytenr,
            &BlockCheck {
                level: src.level,
                generation: src.generation,
                first_key: None,
            },
        )?;
        let first_key = top.first_key().unwrap_or(BtrfsKey::MIN);
        let bytenr = self.alloc_tree_block(trans, new_id, 0, top.level, first_key, src.bytenr)?;
        let generation = trans.generation();
        let copy = TreeBlock {
            bytenr,
            generation,
            owner: new_id,
            flags: 0,
            level: top.level,
            body: top.body.clone(),
        };
        self.blocks.write(&copy)?;
        let children = self.inc_ref(trans, &copy, false)?;

        let mut item = RootItem::new(new_id, bytenr, copy.level, generation);
        item.origin_generation = generation;
        item.last_snapshot = generation;
        {
            let mut roots = self.roots.lock();
            if let Some(src) = roots.get_mut(&src_id) {
                src.last_snapshot = generation;
            }
            roots.insert(new_id, item);
        }
        info!(src_id, new_id, bytenr, children, "snapshot_created");
        Ok(item)
    }

    /// Drop every reference tree `root_id` holds.
    ///
    /// With `update_ref`, blocks shared with other trees are converted to
    /// shared back-references before this tree lets go of them. Cancelling
    /// the handle's context pauses the drop at its next checkpoint; the
    /// progress stays in the root item and a later call, in this or another
    /// transaction, resumes from there.
    pub fn drop_snapshot(
        &self,
        trans: &TransHandle<'_>,
        root_id: u64,
        update_ref: bool,
    ) -> Result<DropReport> {
        self.check_handle(trans)?;
        let mut root = self
            .root(root_id)
            .ok_or_else(|| FxtError::NotFound(format!("root {root_id}")))?;
        let mut env = TreeDropEnv { tree: self, trans };
        match drop_snapshot(trans.cx(), &mut env, &mut root, update_ref) {
            Ok(report) => {
                let mut roots = self.roots.lock();
                match report.status {
                    DropStatus::Finished => {
                        roots.remove(&root_id);
                    }
                    DropStatus::Paused => {
                        roots.insert(root_id, root);
                    }
                }
                info!(
                    root_id,
                    status = ?report.status,
                    visited = report.stats.blocks_visited,
                    freed = report.stats.blocks_freed,
                    "drop_snapshot"
                );
                Ok(report)
            }
            Err(err) => {
                self.note_error(&err);
                self.roots.lock().insert(root_id, root);
                Err(err)
            }
        }
    }
}

/// The walker's view of the engine during one drop.
struct TreeDropEnv<'t, 'h> {
    tree: &'t ExtentTree,
    trans: &'h TransHandle<'t>,
}

impl DropEnv for TreeDropEnv<'_, '_> {
    fn nodesize(&self) -> u32 {
        self.tree.options.nodesize
    }

    fn read_block(&mut self, bytenr: u64, check: &BlockCheck) -> Result<TreeBlock> {
        self.tree.read_tree_block(bytenr, check)
    }

    fn lookup_extent_info(&mut self, bytenr: u64, level: u8) -> Result<ExtentInfo> {
        let nodesize = u64::from(self.tree.options.nodesize);
        self.tree
            .lookup_extent_info(ExtentTarget::tree_block(bytenr, nodesize, level))
    }

    fn queue_ref(&mut self, change: RefChange, block_ref: &BlockRef) -> Result<()> {
        let action = match change {
            RefChange::Add => RefAction::AddRef,
            RefChange::Drop => RefAction::DropRef,
        };
        self.tree.queue_ref(block_ref_request(action, block_ref)?)
    }

    fn set_full_backref(&mut self, block: &TreeBlock) -> Result<()> {
        self.tree.delayed.add_extent_op(
            block.bytenr,
            u64::from(self.tree.options.nodesize),
            ExtentOp::set_flags(BLOCK_FLAG_FULL_BACKREF),
        )
    }

    fn free_tree_block(
        &mut self,
        root: u64,
        block: &TreeBlock,
        parent: u64,
        last_ref: bool,
    ) -> Result<()> {
        self.tree
            .free_tree_block(self.trans, root, block, parent, last_ref)
    }

    fn ref_exists(&mut self, bytenr: u64, parent: u64, root: u64, level: u8) -> Result<bool> {
        self.tree.tree_ref_exists(bytenr, parent, root, level)
    }

    fn checkpoint(&mut self, root: &RootItem) -> Result<()> {
        self.tree.roots.lock().insert(root.root_id, *root);
        // A cancelled drain keeps its heads queued; the walker pauses next.
        match self.tree.throttle(self.trans) {
            Ok(_) | Err(FxtError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
