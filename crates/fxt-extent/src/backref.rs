//! Back-references.
//!
//! Every reference to an extent names its holder. A reference lives either
//! inline in the extent item or as a standalone record keyed next to it:
//!
//! | Identity | Standalone key | Standalone body |
//! |----------|----------------|-----------------|
//! | tree block `root` | `(bytenr, TREE_BLOCK_REF, root)` | empty |
//! | shared block `parent` | `(bytenr, SHARED_BLOCK_REF, parent)` | empty |
//! | data `(root, objectid, offset)` | `(bytenr, EXTENT_DATA_REF, hash + probe)` | data ref |
//! | shared data `parent` | `(bytenr, SHARED_DATA_REF, parent)` | count (4) |
//!
//! Inline refs are kept sorted by variant rank, then discriminator:
//! tree block < shared block < data < shared data. An owner ref, when
//! present, always comes first and is never matched.

use crate::item::{
    DATA_REF_SIZE, DataRef, ExtentItem, InlineRef, ParseResultExt, SHARED_DATA_REF_SIZE,
    inline_ref_size,
};
use fxt_btree::{ItemStore, SearchMode};
use fxt_error::{FxtError, Result};
use fxt_types::{
    BLOCK_GROUP_ITEM_KEY, BtrfsKey, EXTENT_DATA_REF_KEY, FIRST_FREE_OBJECTID, METADATA_ITEM_KEY,
    SHARED_BLOCK_REF_KEY, SHARED_DATA_REF_KEY, TREE_BLOCK_REF_KEY, hash_extent_data_ref,
    read_le_u32,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::trace;

/// The holder of one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefIdentity {
    TreeBlock { root: u64 },
    SharedBlock { parent: u64 },
    ExtentData { root: u64, objectid: u64, offset: u64 },
    SharedData { parent: u64 },
}

impl RefIdentity {
    /// Name a reference the way callers describe it.
    ///
    /// A non-zero `parent` makes the ref shared. Otherwise a tree block is
    /// held by `root` and a data extent by `(root, owner, offset)`. For tree
    /// blocks `owner` is the level and is ignored here.
    #[must_use]
    pub fn new(is_data: bool, parent: u64, root: u64, owner: u64, offset: u64) -> Self {
        match (is_data, parent) {
            (false, 0) => Self::TreeBlock { root },
            (false, parent) => Self::SharedBlock { parent },
            (true, 0) => Self::ExtentData {
                root,
                objectid: owner,
                offset,
            },
            (true, parent) => Self::SharedData { parent },
        }
    }

    /// Derive `is_data` from the owner objectid: tree blocks carry their
    /// level there, which is always below the first inode number.
    #[must_use]
    pub fn from_owner(parent: u64, root: u64, owner: u64, offset: u64) -> Self {
        Self::new(owner >= FIRST_FREE_OBJECTID, parent, root, owner, offset)
    }

    #[must_use]
    pub fn item_type(self) -> u8 {
        match self {
            Self::TreeBlock { .. } => TREE_BLOCK_REF_KEY,
            Self::SharedBlock { .. } => SHARED_BLOCK_REF_KEY,
            Self::ExtentData { .. } => EXTENT_DATA_REF_KEY,
            Self::SharedData { .. } => SHARED_DATA_REF_KEY,
        }
    }

    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, Self::ExtentData { .. } | Self::SharedData { .. })
    }

    #[must_use]
    pub fn is_shared(self) -> bool {
        matches!(self, Self::SharedBlock { .. } | Self::SharedData { .. })
    }

    fn rank(self) -> u8 {
        match self {
            Self::TreeBlock { .. } => 1,
            Self::SharedBlock { .. } => 2,
            Self::ExtentData { .. } => 3,
            Self::SharedData { .. } => 4,
        }
    }

    /// Root objectid, parent bytenr, or data-ref hash.
    #[must_use]
    pub fn discriminator(self) -> u64 {
        match self {
            Self::TreeBlock { root } => root,
            Self::SharedBlock { parent } | Self::SharedData { parent } => parent,
            Self::ExtentData {
                root,
                objectid,
                offset,
            } => hash_extent_data_ref(root, objectid, offset),
        }
    }

    fn order_key(self) -> (u8, u64, u64, u64, u64) {
        match self {
            Self::ExtentData {
                root,
                objectid,
                offset,
            } => (self.rank(), self.discriminator(), root, objectid, offset),
            _ => (self.rank(), self.discriminator(), 0, 0, 0),
        }
    }

    /// Position relative to `other` in the canonical inline order.
    #[must_use]
    pub fn canonical_cmp(self, other: Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }

    #[must_use]
    pub fn inline_size(self) -> usize {
        inline_ref_size(self.item_type())
    }

    #[must_use]
    pub fn to_inline(self, count: u32) -> InlineRef {
        match self {
            Self::TreeBlock { root } => InlineRef::TreeBlock { root },
            Self::SharedBlock { parent } => InlineRef::SharedBlock { parent },
            Self::ExtentData {
                root,
                objectid,
                offset,
            } => InlineRef::ExtentData(DataRef {
                root,
                objectid,
                offset,
                count,
            }),
            Self::SharedData { parent } => InlineRef::SharedData { parent, count },
        }
    }
}

// ── Inline lookup ───────────────────────────────────────────────────────────

/// Result of scanning an extent item's inline refs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineLookup {
    /// `inline[index]` is the ref.
    Found(usize),
    /// Not inline; a new ref would go at `index`.
    NotFound(usize),
    /// Not inline, and a new ref must be a standalone record.
    TooLarge,
}

/// Constraints on growing the item, checked when the lookup is for insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertRoom {
    pub max_item_size: usize,
    /// The extent already has standalone refs.
    pub keyed_refs_present: bool,
}

/// Find `id` among the inline refs of `item`.
///
/// With `insert`, a miss reports `TooLarge` when the item cannot grow by the
/// new ref or when standalone refs exist, so that new refs for an extent with
/// keyed refs are always keyed too.
#[must_use]
pub fn lookup_inline_backref(item: &ExtentItem, id: RefIdentity, insert: Option<InsertRoom>) -> InlineLookup {
    let mut slot = item.inline.len();
    for (index, iref) in item.inline.iter().enumerate() {
        let Some(existing) = iref.identity() else {
            continue;
        };
        match existing.canonical_cmp(id) {
            Ordering::Less => {}
            Ordering::Equal => return InlineLookup::Found(index),
            Ordering::Greater => {
                slot = index;
                break;
            }
        }
    }
    if let Some(room) = insert {
        if item.encoded_size() + id.inline_size() >= room.max_item_size || room.keyed_refs_present {
            return InlineLookup::TooLarge;
        }
    }
    InlineLookup::NotFound(slot)
}

// ── Standalone records ──────────────────────────────────────────────────────

/// A back-reference stored as its own item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandaloneRef {
    pub key: BtrfsKey,
    pub id: RefIdentity,
    pub count: u32,
}

/// Whether any standalone ref is keyed under `bytenr`.
pub fn has_keyed_refs(store: &dyn ItemStore, bytenr: u64) -> Result<bool> {
    let probe = BtrfsKey::new(bytenr, METADATA_ITEM_KEY + 1, 0);
    Ok(matches!(
        store.search(&probe, SearchMode::NextGe)?,
        Some((key, _)) if key.objectid == bytenr && key.item_type < BLOCK_GROUP_ITEM_KEY
    ))
}

fn decode_standalone(key: BtrfsKey, data: &[u8]) -> Result<StandaloneRef> {
    let (id, count) = match key.item_type {
        TREE_BLOCK_REF_KEY => (RefIdentity::TreeBlock { root: key.offset }, 1),
        SHARED_BLOCK_REF_KEY => (RefIdentity::SharedBlock { parent: key.offset }, 1),
        EXTENT_DATA_REF_KEY => {
            let data_ref = DataRef::decode(data, 0).at_bytenr(key.objectid)?;
            (
                RefIdentity::ExtentData {
                    root: data_ref.root,
                    objectid: data_ref.objectid,
                    offset: data_ref.offset,
                },
                data_ref.count,
            )
        }
        SHARED_DATA_REF_KEY => {
            let count = read_le_u32(data, 0).at_bytenr(key.objectid)?;
            if count == 0 {
                return Err(FxtError::corruption(key.objectid, "shared data ref with zero count"));
            }
            (RefIdentity::SharedData { parent: key.offset }, count)
        }
        other => {
            return Err(FxtError::corruption(
                key.objectid,
                format!("unsupported back-reference item type {other}"),
            ));
        }
    };
    Ok(StandaloneRef { key, id, count })
}

/// Every standalone ref of `bytenr`, in key order.
pub fn standalone_backrefs(store: &dyn ItemStore, bytenr: u64) -> Result<Vec<StandaloneRef>> {
    let start = BtrfsKey::new(bytenr, TREE_BLOCK_REF_KEY, 0);
    let end = BtrfsKey::new(bytenr, SHARED_DATA_REF_KEY, u64::MAX);
    store
        .items_in(&start, &end)?
        .into_iter()
        .map(|(key, data)| decode_standalone(key, &data))
        .collect()
}

/// Find the standalone record of `id`.
///
/// Data refs start at their hash and scan forward past colliding records.
pub fn lookup_standalone_backref(
    store: &dyn ItemStore,
    bytenr: u64,
    id: RefIdentity,
) -> Result<Option<StandaloneRef>> {
    let start = BtrfsKey::new(bytenr, id.item_type(), id.discriminator());
    if !matches!(id, RefIdentity::ExtentData { .. }) {
        return match store.get(&start)? {
            Some(data) => decode_standalone(start, &data).map(Some),
            None => Ok(None),
        };
    }
    let end = BtrfsKey::new(bytenr, EXTENT_DATA_REF_KEY, u64::MAX);
    for (key, data) in store.items_in(&start, &end)? {
        let found = decode_standalone(key, &data)?;
        if found.id == id {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Add `count` references for `id` as a standalone record.
///
/// An existing record for a data identity has its count raised. A data
/// identity whose hash slot holds another owner probes `hash + 1, ...`.
pub fn insert_standalone_backref(
    store: &dyn ItemStore,
    bytenr: u64,
    id: RefIdentity,
    count: u32,
) -> Result<StandaloneRef> {
    match id {
        RefIdentity::TreeBlock { .. } | RefIdentity::SharedBlock { .. } => {
            let key = BtrfsKey::new(bytenr, id.item_type(), id.discriminator());
            if count != 1 {
                return Err(FxtError::corruption(bytenr, "tree block refs are added one at a time"));
            }
            store.insert_empty_item(key, 0).map_err(|err| match err {
                FxtError::Exists(_) => FxtError::corruption(bytenr, format!("duplicate tree block backref {key}")),
                other => other,
            })?;
            trace!(bytenr, %key, "standalone tree backref inserted");
            Ok(StandaloneRef { key, id, count: 1 })
        }
        RefIdentity::SharedData { parent } => {
            let key = BtrfsKey::new(bytenr, SHARED_DATA_REF_KEY, parent);
            let total = match store.get(&key)? {
                Some(data) => add_count(bytenr, read_le_u32(&data, 0).at_bytenr(bytenr)?, count)?,
                None => {
                    store.insert_empty_item(key, SHARED_DATA_REF_SIZE)?;
                    count
                }
            };
            store.write_item(&key, 0, &total.to_le_bytes())?;
            trace!(bytenr, parent, count = total, "standalone shared data backref");
            Ok(StandaloneRef { key, id, count: total })
        }
        RefIdentity::ExtentData {
            root,
            objectid,
            offset,
        } => {
            let mut key = BtrfsKey::new(bytenr, EXTENT_DATA_REF_KEY, id.discriminator());
            loop {
                match store.get(&key)? {
                    None => {
                        let data_ref = DataRef {
                            root,
                            objectid,
                            offset,
                            count,
                        };
                        store.insert_empty_item(key, DATA_REF_SIZE)?;
                        store.write_item(&key, 0, &data_ref.encode())?;
                        trace!(bytenr, %key, count, "standalone data backref inserted");
                        return Ok(StandaloneRef { key, id, count });
                    }
                    Some(data) => {
                        let existing = DataRef::decode(&data, 0).at_bytenr(bytenr)?;
                        if existing.matches(root, objectid, offset) {
                            let total = add_count(bytenr, existing.count, count)?;
                            store.write_item(&key, 24, &total.to_le_bytes())?;
                            trace!(bytenr, %key, count = total, "standalone data backref raised");
                            return Ok(StandaloneRef { key, id, count: total });
                        }
                        key.offset = key.offset.wrapping_add(1);
                    }
                }
            }
        }
    }
}

fn add_count(bytenr: u64, current: u32, delta: u32) -> Result<u32> {
    current
        .checked_add(delta)
        .ok_or_else(|| FxtError::corruption(bytenr, "back-reference count overflow"))
}

/// Drop `count` references from a standalone record, deleting it at zero.
///
/// Returns the count left on the record.
pub fn remove_standalone_backref(store: &dyn ItemStore, found: &StandaloneRef, count: u32) -> Result<u32> {
    let bytenr = found.key.objectid;
    let left = found.count.checked_sub(count).ok_or_else(|| {
        FxtError::corruption(
            bytenr,
            format!("dropping {count} refs from a backref holding {}", found.count),
        )
    })?;
    if left == 0 {
        store.del_item(&found.key)?;
    } else {
        let at = match found.id {
            RefIdentity::ExtentData { .. } => 24,
            _ => 0,
        };
        store.write_item(&found.key, at, &left.to_le_bytes())?;
    }
    trace!(bytenr, key = %found.key, left, "standalone backref dropped");
    Ok(left)
}
