//! Queued reference changes.
//!
//! A [`RefNode`] is one pending add or drop against a single extent. Nodes
//! with the same identity and sequence number collapse into one: an add and a
//! drop of equal weight cancel outright.

use fxt_types::is_fstree;
use serde::Serialize;
use std::cmp::Ordering;

// ── Actions ─────────────────────────────────────────────────────────────────

/// What a queued node does to its extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RefAction {
    /// Add a back-reference to an extent that already has an item.
    AddRef,
    /// Create the extent item together with its first back-reference.
    AddExtent,
    /// Drop a back-reference; the last drop deletes the item.
    DropRef,
}

impl RefAction {
    #[must_use]
    pub fn is_add(self) -> bool {
        !matches!(self, Self::DropRef)
    }

    /// Drain order: item creation, then adds, then drops.
    fn rank(self) -> u8 {
        match self {
            Self::AddExtent => 0,
            Self::AddRef => 1,
            Self::DropRef => 2,
        }
    }
}

// ── Identity ────────────────────────────────────────────────────────────────

/// Back-reference a node adds or drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RefKind {
    TreeBlock { root: u64 },
    SharedBlock { parent: u64 },
    ExtentData { root: u64, objectid: u64, offset: u64 },
    SharedData { parent: u64 },
}

impl RefKind {
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, Self::ExtentData { .. } | Self::SharedData { .. })
    }

    #[must_use]
    pub fn is_shared(self) -> bool {
        matches!(self, Self::SharedBlock { .. } | Self::SharedData { .. })
    }

    /// Sort key `(type, root, parent, inode, offset)`.
    ///
    /// Shared refs are identified by their parent alone, so two shared drops
    /// queued by different roots still merge.
    fn sort_key(self) -> (u8, u64, u64, u64, u64) {
        match self {
            Self::TreeBlock { root } => (0, root, 0, 0, 0),
            Self::SharedBlock { parent } => (1, 0, parent, 0, 0),
            Self::ExtentData {
                root,
                objectid,
                offset,
            } => (2, root, 0, objectid, offset),
            Self::SharedData { parent } => (3, 0, parent, 0, 0),
        }
    }
}

impl PartialOrd for RefKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RefKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Position of a node inside its head: identity first, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeKey {
    pub(crate) kind: RefKind,
    pub(crate) seq: u64,
}

// ── Nodes ───────────────────────────────────────────────────────────────────

/// One queued change, owned by the head of its extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefNode {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub action: RefAction,
    pub kind: RefKind,
    /// Root that queued the change. Recorded for shared refs too, although
    /// it takes no part in their identity.
    pub ref_root: u64,
    /// Tree level for tree blocks, inode number for data.
    pub owner: u64,
    /// Tree-mod-log sequence at queue time; zero when not ordered.
    pub seq: u64,
    /// Weight, always positive; `action` carries the sign.
    pub ref_mod: u32,
}

impl RefNode {
    pub(crate) fn key(&self) -> NodeKey {
        NodeKey {
            kind: self.kind,
            seq: self.seq,
        }
    }

    /// Signed contribution to the extent's reference count.
    #[must_use]
    pub fn delta(&self) -> i64 {
        let weight = i64::from(self.ref_mod);
        if self.action.is_add() { weight } else { -weight }
    }

    pub(crate) fn drain_order(&self) -> (u8, NodeKey) {
        (self.action.rank(), self.key())
    }
}

/// Result of folding a node into an existing one of the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fold {
    /// The existing node absorbed the change.
    Merged,
    /// The two nodes cancelled; the existing node must be removed.
    Cancelled,
}

/// Fold `incoming` into `existing`.
///
/// Same-sign changes add their weights. Opposite signs subtract, and the
/// heavier side's action survives. An add that creates the item keeps that
/// role when merged with a plain add.
pub(crate) fn fold_into(existing: &mut RefNode, incoming: &RefNode) -> Fold {
    if existing.action.is_add() == incoming.action.is_add() {
        existing.ref_mod = existing.ref_mod.saturating_add(incoming.ref_mod);
        if incoming.action == RefAction::AddExtent {
            existing.action = RefAction::AddExtent;
        }
    } else if existing.ref_mod < incoming.ref_mod {
        existing.action = incoming.action;
        existing.ref_mod = incoming.ref_mod - existing.ref_mod;
    } else {
        existing.ref_mod -= incoming.ref_mod;
    }
    if existing.ref_mod == 0 {
        Fold::Cancelled
    } else {
        Fold::Merged
    }
}

// ── Requests ────────────────────────────────────────────────────────────────

/// A change as callers describe it, before it is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DelayedRef {
    pub action: RefAction,
    pub bytenr: u64,
    pub num_bytes: u64,
    /// Non-zero for a shared (parent-keyed) reference.
    pub parent: u64,
    pub ref_root: u64,
    /// Root charged for the extent; may be learned late, on a later drop.
    pub owning_root: u64,
    pub owner: u64,
    pub offset: u64,
    pub is_data: bool,
    pub count: u32,
}

impl DelayedRef {
    /// Tree block reference; `level` is the block's height.
    #[must_use]
    pub fn tree(
        action: RefAction,
        bytenr: u64,
        num_bytes: u64,
        parent: u64,
        ref_root: u64,
        level: u8,
    ) -> Self {
        Self {
            action,
            bytenr,
            num_bytes,
            parent,
            ref_root,
            owning_root: ref_root,
            owner: u64::from(level),
            offset: 0,
            is_data: false,
            count: 1,
        }
    }

    /// File extent reference from `(inode, offset)` in `ref_root`.
    #[must_use]
    pub fn data(
        action: RefAction,
        bytenr: u64,
        num_bytes: u64,
        parent: u64,
        ref_root: u64,
        inode: u64,
        offset: u64,
    ) -> Self {
        Self {
            action,
            bytenr,
            num_bytes,
            parent,
            ref_root,
            owning_root: ref_root,
            owner: inode,
            offset,
            is_data: true,
            count: 1,
        }
    }

    #[must_use]
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    #[must_use]
    pub fn with_owning_root(mut self, owning_root: u64) -> Self {
        self.owning_root = owning_root;
        self
    }

    #[must_use]
    pub fn kind(&self) -> RefKind {
        match (self.is_data, self.parent) {
            (false, 0) => RefKind::TreeBlock {
                root: self.ref_root,
            },
            (false, parent) => RefKind::SharedBlock { parent },
            (true, 0) => RefKind::ExtentData {
                root: self.ref_root,
                objectid: self.owner,
                offset: self.offset,
            },
            (true, parent) => RefKind::SharedData { parent },
        }
    }

    /// Whether the node must be ordered against tree-mod-log readers.
    #[must_use]
    pub fn is_sequenced(&self) -> bool {
        is_fstree(self.ref_root)
    }

    pub(crate) fn to_node(self, seq: u64) -> RefNode {
        RefNode {
            bytenr: self.bytenr,
            num_bytes: self.num_bytes,
            action: self.action,
            kind: self.kind(),
            ref_root: self.ref_root,
            owner: self.owner,
            seq,
            ref_mod: self.count,
        }
    }
}
