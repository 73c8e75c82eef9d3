//! Snapshot drop.
//!
//! [`drop_snapshot`] releases every reference a dead tree holds, top down,
//! leaving blocks that other trees still share in place. It descends in one
//! of two stages:
//!
//! - **drop**: a child referenced only by this tree is descended and freed on
//!   the way back up; a shared child is skipped with a single dropped ref.
//! - **update back-refs**: a shared child still written with implicit
//!   root-keyed refs is converted to full back-refs first, so that the
//!   surviving trees keep valid references once this root's refs are gone.
//!
//! The walk is resumable. After each leaf-level step the key of the next
//! unprocessed slot and its level are stored in the [`RootItem`], and a later
//! call picks up from there. Cancellation of the caller's [`Cx`] is observed
//! only at those checkpoints, so a cancelled drop always stops with its
//! progress recorded.

use crate::block::{BlockCheck, TreeBlock};
use crate::refs::{BlockRef, RefChange, child_refs};
use asupersync::Cx;
use fxt_error::{FxtError, Result};
use fxt_types::{BLOCK_FLAG_FULL_BACKREF, BTRFS_MAX_LEVEL, BtrfsKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

const LEVELS: usize = BTRFS_MAX_LEVEL as usize;

/// Persistent description of a tree root, including drop progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub root_id: u64,
    pub bytenr: u64,
    pub level: u8,
    pub generation: u64,
    /// Generation the tree was snapshotted from; zero for original trees.
    pub origin_generation: u64,
    pub last_snapshot: u64,
    /// Key of the next slot to process at `drop_level`. Objectid zero means
    /// the drop has not started.
    pub drop_progress: BtrfsKey,
    pub drop_level: u8,
    /// Set once a drop has begun. A resumed drop re-checks every ref it is
    /// about to skip-drop, since the previous run may have dropped it already.
    pub dead: bool,
}

impl RootItem {
    #[must_use]
    pub fn new(root_id: u64, bytenr: u64, level: u8, generation: u64) -> Self {
        Self {
            root_id,
            bytenr,
            level,
            generation,
            origin_generation: 0,
            last_snapshot: 0,
            drop_progress: BtrfsKey::MIN,
            drop_level: 0,
            dead: false,
        }
    }

    #[must_use]
    pub fn drop_in_progress(&self) -> bool {
        self.drop_progress.objectid != 0
    }
}

/// Reference count and flags of a tree block, including queued changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentInfo {
    pub refs: u64,
    pub flags: u64,
    pub owner_root: u64,
}

/// What the walker needs from the filesystem.
pub trait DropEnv {
    fn nodesize(&self) -> u32;

    fn read_block(&mut self, bytenr: u64, check: &BlockCheck) -> Result<TreeBlock>;

    fn lookup_extent_info(&mut self, bytenr: u64, level: u8) -> Result<ExtentInfo>;

    fn queue_ref(&mut self, change: RefChange, block_ref: &BlockRef) -> Result<()>;

    /// Queue `FULL_BACKREF` onto the extent item of `block`.
    fn set_full_backref(&mut self, block: &TreeBlock) -> Result<()>;

    /// Drop this tree's reference to `block`; `last_ref` when it was the only one.
    fn free_tree_block(
        &mut self,
        root: u64,
        block: &TreeBlock,
        parent: u64,
        last_ref: bool,
    ) -> Result<()>;

    /// Whether the tree-block ref `(bytenr, parent, root)` is still present.
    fn ref_exists(&mut self, bytenr: u64, parent: u64, root: u64, level: u8) -> Result<bool>;

    /// Called with the root item after progress was recorded.
    fn checkpoint(&mut self, root: &RootItem) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DropStats {
    pub blocks_visited: u64,
    pub blocks_converted: u64,
    pub blocks_freed: u64,
    pub shared_refs_dropped: u64,
    pub data_refs_dropped: u64,
    pub checkpoints: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropStatus {
    /// Every reference is gone; the root item can be deleted.
    Finished,
    /// Cancelled at a checkpoint; the root item holds the resume point.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DropReport {
    pub status: DropStatus,
    pub stats: DropStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    DropReference,
    UpdateBackref,
}

#[derive(Debug)]
struct WalkControl {
    refs: [u64; LEVELS],
    flags: [u64; LEVELS],
    update_progress: BtrfsKey,
    drop_progress: BtrfsKey,
    drop_level: u8,
    stage: Stage,
    level: u8,
    shared_level: Option<u8>,
    update_ref: bool,
    restarted: bool,
}

struct Walker<'a, E: DropEnv + ?Sized> {
    env: &'a mut E,
    root: &'a mut RootItem,
    wc: WalkControl,
    nodes: [Option<TreeBlock>; LEVELS],
    slots: [usize; LEVELS],
    stats: DropStats,
}

/// Drop every reference held by the tree described by `root`.
///
/// With `update_ref`, shared subtrees written by this root are converted to
/// full back-refs before this root lets go of them. Errors leave `root` at
/// the last recorded checkpoint, and a cancelled `cx` pauses the walk at the
/// next one.
pub fn drop_snapshot<E: DropEnv + ?Sized>(
    cx: &Cx,
    env: &mut E,
    root: &mut RootItem,
    update_ref: bool,
) -> Result<DropReport> {
    if usize::from(root.level) >= LEVELS {
        return Err(FxtError::corruption(
            root.bytenr,
            format!("root level {} exceeds maximum tree height", root.level),
        ));
    }
    info!(
        root = root.root_id,
        bytenr = root.bytenr,
        level = root.level,
        resumed = root.drop_in_progress(),
        "drop_snapshot_start"
    );
    let mut walker = Walker::start(env, root, update_ref)?;
    let report = walker.run(cx)?;
    info!(
        root = walker.root.root_id,
        status = ?report.status,
        freed = report.stats.blocks_freed,
        converted = report.stats.blocks_converted,
        "drop_snapshot_done"
    );
    Ok(report)
}

impl<'a, E: DropEnv + ?Sized> Walker<'a, E> {
    fn start(env: &'a mut E, root: &'a mut RootItem, update_ref: bool) -> Result<Self> {
        let top = env.read_block(
            root.bytenr,
            &BlockCheck {
                level: root.level,
                generation: root.generation,
                first_key: None,
            },
        )?;
        let restarted = root.dead;
        root.dead = true;
        let mut walker = Self {
            wc: WalkControl {
                refs: [0; LEVELS],
                flags: [0; LEVELS],
                update_progress: BtrfsKey::MIN,
                drop_progress: root.drop_progress,
                drop_level: root.drop_level,
                stage: Stage::DropReference,
                level: root.level,
                shared_level: None,
                update_ref,
                restarted,
            },
            env,
            root,
            nodes: std::array::from_fn(|_| None),
            slots: [0; LEVELS],
            stats: DropStats::default(),
        };
        if walker.root.drop_in_progress() {
            walker.resume(top)?;
        } else {
            walker.nodes[usize::from(walker.root.level)] = Some(top);
        }
        walker.stats.blocks_visited += 1;
        Ok(walker)
    }

    /// Rebuild the path down to the recorded drop level.
    fn resume(&mut self, top: TreeBlock) -> Result<()> {
        let key = self.root.drop_progress;
        let target = self.root.drop_level;
        if target == 0 || target > self.root.level {
            return Err(FxtError::corruption(
                self.root.bytenr,
                format!("invalid drop level {target}"),
            ));
        }
        self.wc.update_progress = key;
        let mut level = self.root.level;
        let mut block = top;
        loop {
            let li = usize::from(level);
            let (slot, _) = block.search_slot(&key);
            let info = self.env.lookup_extent_info(block.bytenr, level)?;
            if info.refs == 0 {
                return Err(FxtError::corruption(block.bytenr, "tree block has no references"));
            }
            self.wc.refs[li] = info.refs;
            self.wc.flags[li] = info.flags;
            self.slots[li] = slot;
            if level == target {
                self.nodes[li] = Some(block);
                break;
            }
            let Some(ptr) = block.ptr(slot).copied() else {
                return Err(FxtError::corruption(block.bytenr, "drop progress points past node"));
            };
            self.nodes[li] = Some(block);
            level -= 1;
            block = self.env.read_block(
                ptr.blockptr,
                &BlockCheck {
                    level,
                    generation: ptr.generation,
                    first_key: Some(ptr.key),
                },
            )?;
        }
        self.wc.level = target;
        debug!(
            root = self.root.root_id,
            level = target,
            key = %key,
            "drop_snapshot_resume"
        );
        Ok(())
    }

    fn run(&mut self, cx: &Cx) -> Result<DropReport> {
        loop {
            self.walk_down_tree()?;
            if self.walk_up_tree()? {
                return Ok(DropReport {
                    status: DropStatus::Finished,
                    stats: self.stats,
                });
            }
            if self.wc.stage == Stage::DropReference {
                let level = self.wc.level;
                if level == 0 {
                    return Err(FxtError::corruption(
                        self.root.bytenr,
                        "drop checkpoint landed on a leaf",
                    ));
                }
                let li = usize::from(level);
                let key = self.node(level)?.key_at(self.slots[li]);
                let Some(key) = key else {
                    return Err(FxtError::corruption(self.root.bytenr, "walk slot out of range"));
                };
                self.wc.drop_level = level;
                self.wc.drop_progress = key;
            }
            self.root.drop_progress = self.wc.drop_progress;
            self.root.drop_level = self.wc.drop_level;
            self.stats.checkpoints += 1;
            self.env.checkpoint(self.root)?;
            if cx.checkpoint().is_err() {
                debug!(
                    root = self.root.root_id,
                    level = self.root.drop_level,
                    key = %self.root.drop_progress,
                    "drop_snapshot_pause"
                );
                return Ok(DropReport {
                    status: DropStatus::Paused,
                    stats: self.stats,
                });
            }
        }
    }

    fn node(&self, level: u8) -> Result<&TreeBlock> {
        self.nodes
            .get(usize::from(level))
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                FxtError::corruption(
                    self.root.bytenr,
                    format!("walk path has no block at level {level}"),
                )
            })
    }

    // ── Descent ─────────────────────────────────────────────────────────────

    fn walk_down_tree(&mut self) -> Result<()> {
        let mut lookup_info = true;
        loop {
            if self.walk_down_proc(lookup_info)? {
                break;
            }
            let level = self.wc.level;
            if level == 0 {
                break;
            }
            if self.slots[usize::from(level)] >= self.node(level)?.nritems() {
                break;
            }
            if self.do_walk_down(&mut lookup_info)? {
                self.slots[usize::from(level)] += 1;
            }
        }
        Ok(())
    }

    /// Process the block at the current level before its children.
    ///
    /// Returns true when the walk must not descend below it.
    fn walk_down_proc(&mut self, lookup_info: bool) -> Result<bool> {
        let level = self.wc.level;
        let li = usize::from(level);
        let Some(block) = self.nodes[li].as_ref() else {
            return Err(FxtError::corruption(self.root.bytenr, "walk lost its current block"));
        };
        if self.wc.stage == Stage::UpdateBackref && block.owner != self.root.root_id {
            return Ok(true);
        }
        let stale = match self.wc.stage {
            Stage::DropReference => self.wc.refs[li] != 1,
            Stage::UpdateBackref => self.wc.flags[li] & BLOCK_FLAG_FULL_BACKREF == 0,
        };
        if lookup_info && stale {
            let info = self.env.lookup_extent_info(block.bytenr, level)?;
            if info.refs == 0 {
                return Err(FxtError::corruption(block.bytenr, "tree block has no references"));
            }
            self.wc.refs[li] = info.refs;
            self.wc.flags[li] = info.flags;
        }
        match self.wc.stage {
            Stage::DropReference => Ok(self.wc.refs[li] > 1),
            Stage::UpdateBackref => {
                if self.wc.flags[li] & BLOCK_FLAG_FULL_BACKREF == 0 {
                    mod_refs(&mut *self.env, block, true, RefChange::Add)?;
                    mod_refs(&mut *self.env, block, false, RefChange::Drop)?;
                    self.env.set_full_backref(block)?;
                    self.wc.flags[li] |= BLOCK_FLAG_FULL_BACKREF;
                    self.stats.blocks_converted += 1;
                    trace!(bytenr = block.bytenr, level, "block_converted_to_full_backref");
                }
                Ok(false)
            }
        }
    }

    /// Step into the child at the current slot, or skip it.
    ///
    /// Returns true when the child was skipped.
    fn do_walk_down(&mut self, lookup_info: &mut bool) -> Result<bool> {
        let level = self.wc.level;
        let li = usize::from(level);
        let slot = self.slots[li];
        let parent_block = self.node(level)?;
        let (parent_bytenr, parent_owner) = (parent_block.bytenr, parent_block.owner);
        let Some(ptr) = parent_block.ptr(slot).copied() else {
            return Err(FxtError::corruption(parent_bytenr, format!("no pointer at slot {slot}")));
        };
        let child_level = level - 1;
        let ci = usize::from(child_level);

        if self.wc.stage == Stage::UpdateBackref && ptr.generation <= self.root.origin_generation {
            *lookup_info = true;
            return Ok(true);
        }
        let info = self.env.lookup_extent_info(ptr.blockptr, child_level)?;
        if info.refs == 0 {
            return Err(FxtError::corruption(ptr.blockptr, "tree block has no references"));
        }
        self.wc.refs[ci] = info.refs;
        self.wc.flags[ci] = info.flags;
        *lookup_info = false;

        let leaf_parent_converted = level == 1 && info.flags & BLOCK_FLAG_FULL_BACKREF != 0;
        let skip = match self.wc.stage {
            Stage::DropReference => {
                info.refs > 1
                    && (leaf_parent_converted
                        || !self.wc.update_ref
                        || ptr.generation <= self.root.origin_generation
                        || ptr.key < self.wc.update_progress)
            }
            Stage::UpdateBackref => leaf_parent_converted,
        };

        if !skip {
            if self.nodes.iter().flatten().any(|held| held.bytenr == ptr.blockptr) {
                return Err(FxtError::corruption(
                    ptr.blockptr,
                    "cycle detected in tree pointers",
                ));
            }
            if self.wc.stage == Stage::DropReference && info.refs > 1 {
                self.wc.stage = Stage::UpdateBackref;
                self.wc.shared_level = Some(child_level);
            }
            let child = self.env.read_block(
                ptr.blockptr,
                &BlockCheck {
                    level: child_level,
                    generation: ptr.generation,
                    first_key: Some(ptr.key),
                },
            )?;
            self.nodes[ci] = Some(child);
            self.slots[ci] = 0;
            self.wc.level = child_level;
            self.stats.blocks_visited += 1;
            return Ok(false);
        }

        self.wc.refs[ci] = 0;
        self.wc.flags[ci] = 0;
        if self.wc.stage == Stage::DropReference {
            let parent = if self.wc.flags[li] & BLOCK_FLAG_FULL_BACKREF != 0 {
                parent_bytenr
            } else if parent_owner == self.root.root_id {
                0
            } else {
                return Err(owner_mismatch(parent_bytenr, parent_owner, self.root.root_id));
            };
            let mut drop = true;
            if self.wc.restarted {
                if self
                    .env
                    .ref_exists(ptr.blockptr, parent, self.root.root_id, child_level)?
                {
                    self.wc.restarted = false;
                } else {
                    drop = false;
                }
            }
            if drop {
                self.env.queue_ref(
                    RefChange::Drop,
                    &BlockRef {
                        bytenr: ptr.blockptr,
                        num_bytes: u64::from(self.env.nodesize()),
                        parent,
                        root: self.root.root_id,
                        owner: u64::from(child_level),
                        offset: 0,
                        is_data: false,
                    },
                )?;
                self.stats.shared_refs_dropped += 1;
                trace!(bytenr = ptr.blockptr, parent, level = child_level, "shared_block_ref_dropped");
            }
        }
        *lookup_info = true;
        Ok(true)
    }

    // ── Ascent ──────────────────────────────────────────────────────────────

    /// Returns true when the whole tree has been walked.
    fn walk_up_tree(&mut self) -> Result<bool> {
        let mut level = self.wc.level;
        let nritems = self.node(level)?.nritems();
        self.slots[usize::from(level)] = nritems;
        while usize::from(level) < LEVELS && self.nodes[usize::from(level)].is_some() {
            let li = usize::from(level);
            self.wc.level = level;
            if self.slots[li] + 1 < self.node(level)?.nritems() {
                self.slots[li] += 1;
                return Ok(false);
            }
            if self.walk_up_proc()? {
                return Ok(false);
            }
            self.nodes[li] = None;
            level += 1;
        }
        Ok(true)
    }

    /// Finish the block at the current level after its children.
    ///
    /// Returns true when the block turned out to be unshared after its
    /// conversion and must be walked again in the drop stage.
    fn walk_up_proc(&mut self) -> Result<bool> {
        let level = self.wc.level;
        let li = usize::from(level);
        let root_id = self.root.root_id;

        if self.wc.stage == Stage::UpdateBackref {
            let Some(shared_level) = self.wc.shared_level else {
                return Err(FxtError::corruption(self.root.bytenr, "update walk lost its shared level"));
            };
            if level < shared_level {
                self.wc.refs[li] = 0;
                self.wc.flags[li] = 0;
                return Ok(false);
            }
            match self.find_next_key(level + 1) {
                Some(key) => self.wc.update_progress = key,
                None => self.wc.update_ref = false,
            }
            self.wc.stage = Stage::DropReference;
            self.wc.shared_level = None;
            self.slots[li] = 0;

            let bytenr = self.node(level)?.bytenr;
            let info = self.env.lookup_extent_info(bytenr, level)?;
            if info.refs == 0 {
                return Err(FxtError::corruption(bytenr, "tree block has no references"));
            }
            self.wc.refs[li] = info.refs;
            self.wc.flags[li] = info.flags;
            if info.refs == 1 {
                return Ok(true);
            }
        }

        let Some(block) = self.nodes[li].as_ref() else {
            return Err(FxtError::corruption(self.root.bytenr, "walk lost its current block"));
        };
        let last_ref = self.wc.refs[li] == 1;
        if last_ref && level == 0 {
            let full = self.wc.flags[li] & BLOCK_FLAG_FULL_BACKREF != 0;
            self.stats.data_refs_dropped += mod_refs(&mut *self.env, block, full, RefChange::Drop)?;
        }

        let parent = if block.bytenr == self.root.bytenr {
            if self.wc.flags[li] & BLOCK_FLAG_FULL_BACKREF != 0 {
                block.bytenr
            } else if block.owner == root_id {
                0
            } else {
                return Err(owner_mismatch(block.bytenr, block.owner, root_id));
            }
        } else {
            let Some(up) = self.nodes.get(li + 1).and_then(Option::as_ref) else {
                return Err(FxtError::corruption(block.bytenr, "walk lost the parent block"));
            };
            if self.wc.flags[li + 1] & BLOCK_FLAG_FULL_BACKREF != 0 {
                up.bytenr
            } else if up.owner == root_id {
                0
            } else {
                return Err(owner_mismatch(up.bytenr, up.owner, root_id));
            }
        };
        self.env.free_tree_block(root_id, block, parent, last_ref)?;
        self.stats.blocks_freed += 1;
        trace!(bytenr = block.bytenr, level, parent, last_ref, "tree_block_released");

        self.wc.refs[li] = 0;
        self.wc.flags[li] = 0;
        Ok(false)
    }

    /// Key of the next unvisited slot at or above `level`.
    fn find_next_key(&self, level: u8) -> Option<BtrfsKey> {
        for li in usize::from(level)..LEVELS {
            let block = self.nodes[li].as_ref()?;
            if self.slots[li] + 1 < block.nritems() {
                return block.key_at(self.slots[li] + 1);
            }
        }
        None
    }
}

/// Queue a change for every reference `block` holds on its children.
fn mod_refs<E: DropEnv + ?Sized>(
    env: &mut E,
    block: &TreeBlock,
    full_backref: bool,
    change: RefChange,
) -> Result<u64> {
    let refs = child_refs(block, full_backref, env.nodesize())?;
    for block_ref in &refs {
        env.queue_ref(change, block_ref)?;
    }
    Ok(refs.len() as u64)
}

fn owner_mismatch(bytenr: u64, owner: u64, root: u64) -> FxtError {
    FxtError::corruption(
        bytenr,
        format!("unexpected tree owner, have {owner} expect {root}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockBody, FileExtent, LeafItem, NodePtr};
    use crate::store::BlockStore;
    use fxt_types::EXTENT_DATA_KEY;
    use std::collections::{BTreeMap, HashSet};

    const NODESIZE: u32 = 4096;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Queue(RefChange, BlockRef),
        FullBackref(u64),
        Free { bytenr: u64, parent: u64, last_ref: bool },
    }

    struct MockEnv {
        store: BlockStore,
        extents: BTreeMap<u64, (u64, u64)>,
        events: Vec<Event>,
        missing: HashSet<u64>,
        /// Extent whose other owner lets go while it is being converted.
        released_on_convert: Option<u64>,
    }

    impl MockEnv {
        fn new() -> Self {
            Self {
                store: BlockStore::new(NODESIZE),
                extents: BTreeMap::new(),
                events: Vec::new(),
                missing: HashSet::new(),
                released_on_convert: None,
            }
        }

        fn add(&mut self, block: &TreeBlock, refs: u64) {
            self.store.write(block).expect("write block");
            self.extents.insert(block.bytenr, (refs, 0));
        }

        fn refs(&self, bytenr: u64) -> u64 {
            self.extents.get(&bytenr).map_or(0, |&(refs, _)| refs)
        }

        fn flags(&self, bytenr: u64) -> u64 {
            self.extents.get(&bytenr).map_or(0, |&(_, flags)| flags)
        }

        fn frees(&self) -> Vec<u64> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    Event::Free { bytenr, .. } => Some(*bytenr),
                    _ => None,
                })
                .collect()
        }

        fn data_drops(&self) -> usize {
            self.events
                .iter()
                .filter(|event| matches!(event, Event::Queue(RefChange::Drop, r) if r.is_data))
                .count()
        }
    }

    impl DropEnv for MockEnv {
        fn nodesize(&self) -> u32 {
            NODESIZE
        }

        fn read_block(&mut self, bytenr: u64, check: &BlockCheck) -> Result<TreeBlock> {
            self.store.read(bytenr, check)
        }

        fn lookup_extent_info(&mut self, bytenr: u64, _level: u8) -> Result<ExtentInfo> {
            let &(refs, flags) = self
                .extents
                .get(&bytenr)
                .ok_or_else(|| FxtError::NotFound(format!("extent {bytenr}")))?;
            Ok(ExtentInfo {
                refs,
                flags,
                owner_root: 0,
            })
        }

        fn queue_ref(&mut self, change: RefChange, block_ref: &BlockRef) -> Result<()> {
            if !block_ref.is_data {
                let entry = self.extents.entry(block_ref.bytenr).or_insert((0, 0));
                match change {
                    RefChange::Add => entry.0 += 1,
                    RefChange::Drop => entry.0 -= 1,
                }
            }
            self.events.push(Event::Queue(change, *block_ref));
            Ok(())
        }

        fn set_full_backref(&mut self, block: &TreeBlock) -> Result<()> {
            if let Some(entry) = self.extents.get_mut(&block.bytenr) {
                entry.1 |= BLOCK_FLAG_FULL_BACKREF;
                if self.released_on_convert == Some(block.bytenr) {
                    entry.0 -= 1;
                }
            }
            self.events.push(Event::FullBackref(block.bytenr));
            Ok(())
        }

        fn free_tree_block(
            &mut self,
            _root: u64,
            block: &TreeBlock,
            parent: u64,
            last_ref: bool,
        ) -> Result<()> {
            if let Some(entry) = self.extents.get_mut(&block.bytenr) {
                entry.0 -= 1;
            }
            self.events.push(Event::Free {
                bytenr: block.bytenr,
                parent,
                last_ref,
            });
            Ok(())
        }

        fn ref_exists(&mut self, bytenr: u64, _parent: u64, _root: u64, _level: u8) -> Result<bool> {
            Ok(!self.missing.contains(&bytenr))
        }

        fn checkpoint(&mut self, _root: &RootItem) -> Result<()> {
            Ok(())
        }
    }

    fn leaf(bytenr: u64, owner: u64, objectid: u64, extents: &[u64]) -> TreeBlock {
        let items = extents
            .iter()
            .enumerate()
            .map(|(i, &disk_bytenr)| LeafItem {
                key: BtrfsKey::new(objectid, EXTENT_DATA_KEY, i as u64 * 4096),
                data: FileExtent::regular(10, disk_bytenr, 4096, 0).encode(),
            })
            .collect();
        TreeBlock::leaf(bytenr, 10, owner, items)
    }

    fn node(bytenr: u64, owner: u64, level: u8, children: &[&TreeBlock]) -> TreeBlock {
        let ptrs = children
            .iter()
            .map(|child| NodePtr {
                key: child.first_key().expect("child has items"),
                blockptr: child.bytenr,
                generation: child.generation,
            })
            .collect();
        TreeBlock::node(bytenr, 10, owner, level, ptrs)
    }

    fn root_of(block: &TreeBlock, root_id: u64) -> RootItem {
        RootItem::new(root_id, block.bytenr, block.level, block.generation)
    }

    /// Root 5 and snapshot 256 both point at `P`, which points at leaf `Y`.
    fn shared_tree(env: &mut MockEnv) -> RootItem {
        let y = leaf(0x30000, 5, 256, &[0x100000]);
        let p = node(0x20000, 5, 1, &[&y]);
        let r5 = node(0x10000, 5, 2, &[&p]);
        let r256 = node(0x40000, 256, 2, &[&p]);
        env.add(&y, 1);
        env.add(&p, 2);
        env.add(&r5, 1);
        env.add(&r256, 1);
        root_of(&r5, 5)
    }

    #[test]
    fn unshared_tree_is_released_bottom_up() {
        let cx = Cx::for_testing();
        let mut env = MockEnv::new();
        let l1 = leaf(0x20000, 5, 256, &[0x100000, 0x101000]);
        let l2 = leaf(0x30000, 5, 257, &[0x102000]);
        let top = node(0x10000, 5, 1, &[&l1, &l2]);
        env.add(&l1, 1);
        env.add(&l2, 1);
        env.add(&top, 1);
        let mut root = root_of(&top, 5);

        let report = drop_snapshot(&cx, &mut env, &mut root, true).expect("drop");
        assert_eq!(report.status, DropStatus::Finished);
        assert_eq!(env.frees(), vec![0x20000, 0x30000, 0x10000]);
        assert_eq!(env.data_drops(), 3);
        assert!(env.events.iter().all(|event| match event {
            Event::Free { parent, last_ref, .. } => *parent == 0 && *last_ref,
            Event::Queue(change, r) => *change == RefChange::Drop && r.parent == 0 && r.root == 5,
            Event::FullBackref(_) => false,
        }));
        assert_eq!(report.stats.checkpoints, 1);
        assert_eq!(report.stats.blocks_freed, 3);
    }

    #[test]
    fn shared_subtree_is_converted_before_release() {
        let cx = Cx::for_testing();
        let mut env = MockEnv::new();
        let mut root = shared_tree(&mut env);

        let report = drop_snapshot(&cx, &mut env, &mut root, true).expect("drop");
        assert_eq!(report.status, DropStatus::Finished);
        let tree_ref = |change, parent, root| {
            Event::Queue(
                change,
                BlockRef {
                    bytenr: 0x30000,
                    num_bytes: u64::from(NODESIZE),
                    parent,
                    root,
                    owner: 0,
                    offset: 0,
                    is_data: false,
                },
            )
        };
        let data_ref = |change, parent| {
            Event::Queue(
                change,
                BlockRef {
                    bytenr: 0x100000,
                    num_bytes: 4096,
                    parent,
                    root: 5,
                    owner: 256,
                    offset: 0,
                    is_data: true,
                },
            )
        };
        assert_eq!(
            env.events,
            vec![
                tree_ref(RefChange::Add, 0x20000, 5),
                tree_ref(RefChange::Drop, 0, 5),
                Event::FullBackref(0x20000),
                data_ref(RefChange::Add, 0x30000),
                data_ref(RefChange::Drop, 0),
                Event::FullBackref(0x30000),
                Event::Free {
                    bytenr: 0x20000,
                    parent: 0,
                    last_ref: false,
                },
                Event::Free {
                    bytenr: 0x10000,
                    parent: 0,
                    last_ref: true,
                },
            ]
        );
        assert_eq!(env.refs(0x30000), 1);
        assert_eq!(env.refs(0x20000), 1);
        assert_ne!(env.flags(0x30000) & BLOCK_FLAG_FULL_BACKREF, 0);
        assert_eq!(report.stats.blocks_converted, 2);
    }

    #[test]
    fn shared_child_is_skipped_without_update_ref() {
        let cx = Cx::for_testing();
        let mut env = MockEnv::new();
        let mut root = shared_tree(&mut env);

        drop_snapshot(&cx, &mut env, &mut root, false).expect("drop");
        assert_eq!(
            env.events,
            vec![
                Event::Queue(
                    RefChange::Drop,
                    BlockRef {
                        bytenr: 0x20000,
                        num_bytes: u64::from(NODESIZE),
                        parent: 0,
                        root: 5,
                        owner: 1,
                        offset: 0,
                        is_data: false,
                    },
                ),
                Event::Free {
                    bytenr: 0x10000,
                    parent: 0,
                    last_ref: true,
                },
            ]
        );
        assert_eq!(env.refs(0x20000), 1);
        assert_eq!(env.refs(0x30000), 1);
    }

    fn three_leaf_tree(env: &mut MockEnv) -> RootItem {
        let leaves: Vec<TreeBlock> = (0..3_u64)
            .map(|i| leaf(0x20000 + i * 0x1000, 5, 256 + i, &[0x100000 + i * 0x1000]))
            .collect();
        let refs: Vec<&TreeBlock> = leaves.iter().collect();
        let top = node(0x10000, 5, 1, &refs);
        for block in &leaves {
            env.add(block, 1);
        }
        env.add(&top, 1);
        root_of(&top, 5)
    }

    #[test]
    fn cancelled_drop_resumes_where_it_stopped() {
        let mut env = MockEnv::new();
        let mut root = three_leaf_tree(&mut env);

        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);
        let first = drop_snapshot(&cx, &mut env, &mut root, true).expect("first pass");
        assert_eq!(first.status, DropStatus::Paused);
        assert_eq!(root.drop_level, 1);
        assert_eq!(root.drop_progress, BtrfsKey::new(257, EXTENT_DATA_KEY, 0));
        assert!(root.dead);
        assert_eq!(env.frees(), vec![0x20000]);

        let cx = Cx::for_testing();
        let second = drop_snapshot(&cx, &mut env, &mut root, true).expect("second pass");
        assert_eq!(second.status, DropStatus::Finished);
        assert_eq!(env.frees(), vec![0x20000, 0x21000, 0x22000, 0x10000]);
        assert_eq!(env.data_drops(), 3);
    }

    #[test]
    fn restarted_drop_skips_refs_already_gone() {
        let cx = Cx::for_testing();
        let mut env = MockEnv::new();
        let shared = leaf(0x20000, 5, 256, &[0x100000]);
        let own = leaf(0x21000, 5, 257, &[0x101000]);
        let top = node(0x10000, 5, 1, &[&shared, &own]);
        env.add(&shared, 2);
        env.add(&own, 1);
        env.add(&top, 1);
        env.missing.insert(0x20000);
        let mut root = root_of(&top, 5);
        root.dead = true;
        root.drop_progress = BtrfsKey::new(256, EXTENT_DATA_KEY, 0);
        root.drop_level = 1;

        drop_snapshot(&cx, &mut env, &mut root, false).expect("drop");
        assert!(!env.events.iter().any(
            |event| matches!(event, Event::Queue(RefChange::Drop, r) if r.bytenr == 0x20000)
        ));
        assert_eq!(env.refs(0x20000), 2);
        assert_eq!(env.frees(), vec![0x21000, 0x10000]);
    }

    #[test]
    fn corrupt_child_stops_the_walk_at_the_last_checkpoint() {
        let cx = Cx::for_testing();
        let mut env = MockEnv::new();
        let mut root = three_leaf_tree(&mut env);
        assert!(env.store.corrupt(0x21000, 300));

        let err = drop_snapshot(&cx, &mut env, &mut root, true).expect_err("corrupt leaf");
        assert!(matches!(err, FxtError::Corruption { block, .. } if block == 0x21000));
        assert_eq!(root.drop_level, 1);
        assert_eq!(root.drop_progress, BtrfsKey::new(257, EXTENT_DATA_KEY, 0));
        assert_eq!(env.frees(), vec![0x20000]);
    }

    #[test]
    fn pointer_cycle_is_corruption() {
        let cx = Cx::for_testing();
        let mut env = MockEnv::new();
        let l = leaf(0x20000, 5, 256, &[0x100000]);
        let mut top = node(0x10000, 5, 1, &[&l]);
        if let BlockBody::Node(ptrs) = &mut top.body {
            ptrs.push(NodePtr {
                key: BtrfsKey::new(300, 1, 0),
                blockptr: 0x10000,
                generation: 10,
            });
        }
        env.add(&top, 1);
        env.add(&l, 1);
        let mut root = root_of(&top, 5);
        let err = drop_snapshot(&cx, &mut env, &mut root, true).expect_err("cycle");
        assert!(matches!(err, FxtError::Corruption { block, .. } if block == 0x10000));
        assert_eq!(env.frees(), vec![0x20000]);
    }

    #[test]
    fn leaf_left_unshared_by_conversion_is_corruption() {
        let mut env = MockEnv::new();
        let y = leaf(0x20000, 5, 256, &[0x100000]);
        let top = node(0x10000, 5, 1, &[&y]);
        env.add(&y, 2);
        env.add(&top, 1);
        env.released_on_convert = Some(0x20000);
        let mut root = root_of(&top, 5);

        let cx = Cx::for_testing();
        let err = drop_snapshot(&cx, &mut env, &mut root, true).expect_err("leaf checkpoint");
        assert!(matches!(err, FxtError::Corruption { block, .. } if block == 0x10000));
        assert_eq!(env.flags(0x20000) & BLOCK_FLAG_FULL_BACKREF, BLOCK_FLAG_FULL_BACKREF);
        assert!(env.frees().is_empty());
        assert_eq!(root.drop_level, 0);
    }
}
