//! Extent items and their back-references over an [`ItemStore`].
//!
//! [`ExtentStore`] is the only code that rewrites extent item bytes. Inline
//! refs are spliced in and out in place: growing the item shifts the tail
//! right, removing a ref shifts it left and truncates.

use crate::backref::{
    InlineLookup, InsertRoom, RefIdentity, StandaloneRef, has_keyed_refs, insert_standalone_backref,
    lookup_inline_backref, lookup_standalone_backref, remove_standalone_backref,
    standalone_backrefs,
};
use crate::item::{ExtentItem, InlineRef, ParseResultExt, TreeBlockInfo, max_extent_item_size};
use fxt_btree::ItemStore;
use fxt_error::{FxtError, Result};
use fxt_types::{
    BtrfsKey, EXTENT_FLAG_DATA, EXTENT_FLAG_TREE_BLOCK, EXTENT_ITEM_KEY, ExtentOp,
    METADATA_ITEM_KEY,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// How to find one extent: its start, its length, and its level when it is a
/// tree block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentTarget {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub level: Option<u8>,
}

impl ExtentTarget {
    #[must_use]
    pub const fn data(bytenr: u64, num_bytes: u64) -> Self {
        Self {
            bytenr,
            num_bytes,
            level: None,
        }
    }

    #[must_use]
    pub const fn tree_block(bytenr: u64, nodesize: u64, level: u8) -> Self {
        Self {
            bytenr,
            num_bytes: nodesize,
            level: Some(level),
        }
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        self.level.is_none()
    }
}

/// A decoded extent item and the key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtentRecord {
    pub key: BtrfsKey,
    pub item: ExtentItem,
}

impl ExtentRecord {
    /// Length of the extent; skinny items store the level instead.
    #[must_use]
    pub fn num_bytes(&self, nodesize: u64) -> u64 {
        if self.key.item_type == METADATA_ITEM_KEY {
            nodesize
        } else {
            self.key.offset
        }
    }
}

/// A freshly allocated extent, materialized by its first reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewExtent {
    pub target: ExtentTarget,
    pub generation: u64,
    /// Extra flags, such as `BLOCK_FLAG_FULL_BACKREF`.
    pub flags: u64,
    /// First key of a tree block; kept only on legacy items.
    pub first_key: BtrfsKey,
    pub backref: RefIdentity,
    pub refs: u32,
    /// Owning root recorded ahead of the refs of a data extent.
    pub owner_root: Option<u64>,
}

/// What a dropped reference left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    Remaining { refs: u64 },
    /// The extent item is gone; the range is free once pinned and committed.
    Removed { flags: u64, owner_root: Option<u64> },
}

/// One back-reference of an extent, inline or standalone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Backref {
    pub id: RefIdentity,
    pub count: u64,
    pub inline: bool,
}

pub struct ExtentStore {
    store: Arc<dyn ItemStore>,
    sectorsize: u64,
    skinny_metadata: bool,
}

impl std::fmt::Debug for ExtentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentStore")
            .field("nodesize", &self.store.nodesize())
            .field("sectorsize", &self.sectorsize)
            .field("skinny_metadata", &self.skinny_metadata)
            .finish_non_exhaustive()
    }
}

fn apply_op(item: &mut ExtentItem, op: Option<&ExtentOp>) {
    let Some(op) = op else {
        return;
    };
    if op.update_flags {
        item.flags |= op.flags_to_set;
    }
    if op.update_key {
        if let (Some(info), Some(key)) = (item.tree_block.as_mut(), op.key) {
            info.key = key;
        }
    }
}

impl ExtentStore {
    #[must_use]
    pub fn new(store: Arc<dyn ItemStore>, sectorsize: u64, skinny_metadata: bool) -> Self {
        Self {
            store,
            sectorsize,
            skinny_metadata,
        }
    }

    #[must_use]
    pub fn items(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    #[must_use]
    pub fn skinny_metadata(&self) -> bool {
        self.skinny_metadata
    }

    #[must_use]
    pub fn max_item_size(&self) -> usize {
        max_extent_item_size(self.store.nodesize())
    }

    pub(crate) fn decode(&self, key: BtrfsKey, data: &[u8]) -> Result<ExtentRecord> {
        let item = ExtentItem::decode(&key, data, self.sectorsize).at_bytenr(key.objectid)?;
        Ok(ExtentRecord { key, item })
    }

    fn write_header(&self, key: &BtrfsKey, item: &ExtentItem) -> Result<()> {
        self.store.write_item(key, 0, &item.encode_header())
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// The extent item for `target`.
    ///
    /// Tree blocks are looked up under their skinny key first, then under
    /// the legacy key carrying the length.
    pub fn lookup_extent(&self, target: ExtentTarget) -> Result<Option<ExtentRecord>> {
        if let Some(level) = target.level {
            if self.skinny_metadata {
                let key = BtrfsKey::new(target.bytenr, METADATA_ITEM_KEY, u64::from(level));
                if let Some(data) = self.store.get(&key)? {
                    return self.decode(key, &data).map(Some);
                }
            }
        }
        let key = BtrfsKey::new(target.bytenr, EXTENT_ITEM_KEY, target.num_bytes);
        match self.store.get(&key)? {
            Some(data) => self.decode(key, &data).map(Some),
            None => Ok(None),
        }
    }

    /// The extent item starting at `bytenr`, whatever its length or level.
    pub fn find_extent(&self, bytenr: u64) -> Result<Option<ExtentRecord>> {
        let start = BtrfsKey::new(bytenr, EXTENT_ITEM_KEY, 0);
        let end = BtrfsKey::new(bytenr, METADATA_ITEM_KEY, u64::MAX);
        match self.store.items_in(&start, &end)?.into_iter().next() {
            Some((key, data)) => self.decode(key, &data).map(Some),
            None => Ok(None),
        }
    }

    /// Every extent item in the store, in bytenr order.
    pub fn extent_records(&self) -> Result<Vec<ExtentRecord>> {
        self.store
            .items_in(&BtrfsKey::MIN, &BtrfsKey::MAX)?
            .into_iter()
            .filter(|(key, _)| matches!(key.item_type, EXTENT_ITEM_KEY | METADATA_ITEM_KEY))
            .map(|(key, data)| self.decode(key, &data))
            .collect()
    }

    // ── Creation ────────────────────────────────────────────────────────────

    /// Insert the item for a newly allocated extent with its first ref.
    pub fn insert_extent(&self, new: &NewExtent) -> Result<ExtentRecord> {
        let target = new.target;
        let bytenr = target.bytenr;
        if new.backref.is_data() != target.is_data() {
            return Err(FxtError::corruption(bytenr, "first backref does not match the extent kind"));
        }
        if new.refs == 0 || (!target.is_data() && new.refs != 1) {
            return Err(FxtError::corruption(
                bytenr,
                format!("new extent created with {} refs", new.refs),
            ));
        }
        let (key, tree_block, kind) = match target.level {
            None => (
                BtrfsKey::new(bytenr, EXTENT_ITEM_KEY, target.num_bytes),
                None,
                EXTENT_FLAG_DATA,
            ),
            Some(level) if self.skinny_metadata => (
                BtrfsKey::new(bytenr, METADATA_ITEM_KEY, u64::from(level)),
                None,
                EXTENT_FLAG_TREE_BLOCK,
            ),
            Some(level) => (
                BtrfsKey::new(bytenr, EXTENT_ITEM_KEY, target.num_bytes),
                Some(TreeBlockInfo {
                    key: new.first_key,
                    level,
                }),
                EXTENT_FLAG_TREE_BLOCK,
            ),
        };
        let mut inline = Vec::with_capacity(2);
        if let (Some(root), true) = (new.owner_root, target.is_data()) {
            inline.push(InlineRef::Owner { root });
        }
        inline.push(new.backref.to_inline(new.refs));
        let item = ExtentItem {
            refs: u64::from(new.refs),
            generation: new.generation,
            flags: kind | new.flags,
            tree_block,
            inline,
        };
        self.store
            .insert_item(key, &item.encode())
            .map_err(|err| match err {
                FxtError::Exists(_) => FxtError::corruption(bytenr, "extent item already exists"),
                other => other,
            })?;
        trace!(bytenr, %key, refs = item.refs, "extent item inserted");
        Ok(ExtentRecord { key, item })
    }

    // ── Inline refs ─────────────────────────────────────────────────────────

    /// Splice a new inline ref for `id` in at `slot`.
    ///
    /// Returns the extent's new ref count.
    pub fn insert_inline_backref(
        &self,
        record: &ExtentRecord,
        slot: usize,
        id: RefIdentity,
        count: u32,
        op: Option<&ExtentOp>,
    ) -> Result<u64> {
        let bytenr = record.key.objectid;
        let new_ref = id.to_inline(count);
        let offset = record.item.inline_offset(slot);
        let bytes = record.item.encode();
        let mut payload = Vec::with_capacity(new_ref.encoded_size() + bytes.len() - offset);
        new_ref.encode_into(&mut payload);
        payload.extend_from_slice(&bytes[offset..]);

        let mut item = record.item.clone();
        item.refs = item
            .refs
            .checked_add(u64::from(count))
            .ok_or_else(|| FxtError::corruption(bytenr, "extent refs overflow"))?;
        item.inline.insert(slot.min(item.inline.len()), new_ref);
        apply_op(&mut item, op);

        self.store.extend_item(&record.key, new_ref.encoded_size())?;
        self.store.write_item(&record.key, offset, &payload)?;
        self.write_header(&record.key, &item)?;
        trace!(bytenr, ?id, count, refs = item.refs, "inline backref inserted");
        Ok(item.refs)
    }

    /// Change the count of `inline[index]` by `delta`.
    ///
    /// A ref whose count reaches zero is spliced out; an extent whose refs
    /// reach zero is deleted.
    pub fn update_inline_backref(
        &self,
        record: &ExtentRecord,
        index: usize,
        delta: i64,
        op: Option<&ExtentOp>,
    ) -> Result<DropOutcome> {
        let bytenr = record.key.objectid;
        let iref = *record
            .item
            .inline
            .get(index)
            .ok_or_else(|| FxtError::corruption(bytenr, format!("no inline ref at index {index}")))?;
        let id = iref
            .identity()
            .ok_or_else(|| FxtError::corruption(bytenr, "owner refs carry no count"))?;
        let magnitude = delta.unsigned_abs();
        let (new_count, refs) = if delta >= 0 {
            (
                iref.count().checked_add(magnitude),
                record.item.refs.checked_add(magnitude),
            )
        } else {
            (
                iref.count().checked_sub(magnitude),
                record.item.refs.checked_sub(magnitude),
            )
        };
        let (Some(new_count), Some(refs)) = (new_count, refs) else {
            return Err(FxtError::corruption(
                bytenr,
                format!(
                    "backref count {} and refs {} cannot move by {delta}",
                    iref.count(),
                    record.item.refs
                ),
            ));
        };
        if !id.is_data() && new_count > 1 {
            return Err(FxtError::corruption(bytenr, "tree block backrefs hold a single ref"));
        }
        if refs == 0 {
            if new_count != 0 {
                return Err(FxtError::corruption(bytenr, "refs reach zero while a backref remains"));
            }
            return self.remove_extent(record, Some(index), None);
        }

        let mut item = record.item.clone();
        item.refs = refs;
        apply_op(&mut item, op);
        let offset = record.item.inline_offset(index);
        if new_count == 0 {
            let size = iref.encoded_size();
            let bytes = record.item.encode();
            let tail = &bytes[offset + size..];
            if !tail.is_empty() {
                self.store.write_item(&record.key, offset, tail)?;
            }
            self.store.truncate_item(&record.key, bytes.len() - size)?;
            item.inline.remove(index);
        } else {
            let new_count = u32::try_from(new_count)
                .map_err(|_| FxtError::corruption(bytenr, "backref count overflow"))?;
            let at = iref
                .count_offset()
                .ok_or_else(|| FxtError::corruption(bytenr, "backref has no count field"))?;
            self.store
                .write_item(&record.key, offset + at, &new_count.to_le_bytes())?;
            item.inline[index] = id.to_inline(new_count);
        }
        self.write_header(&record.key, &item)?;
        trace!(bytenr, ?id, delta, refs, "inline backref updated");
        Ok(DropOutcome::Remaining { refs })
    }

    fn remove_extent(
        &self,
        record: &ExtentRecord,
        inline_index: Option<usize>,
        standalone: Option<&StandaloneRef>,
    ) -> Result<DropOutcome> {
        let bytenr = record.key.objectid;
        let inline_left: u64 = record
            .item
            .inline
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != inline_index)
            .map(|(_, iref)| iref.count())
            .sum();
        let keyed_left = standalone_backrefs(self.store.as_ref(), bytenr)?
            .iter()
            .filter(|r| Some(r.key) != standalone.map(|s| s.key))
            .count();
        if inline_left != 0 || keyed_left != 0 {
            return Err(FxtError::corruption(
                bytenr,
                format!("refs reach zero with {inline_left} inline and {keyed_left} keyed refs left"),
            ));
        }
        let mut keys = vec![record.key];
        keys.extend(standalone.map(|s| s.key));
        self.store.del_items(&keys)?;
        debug!(bytenr, key = %record.key, "extent item removed");
        Ok(DropOutcome::Removed {
            flags: record.item.flags,
            owner_root: record.item.owner_root(),
        })
    }

    fn check_kind(record: &ExtentRecord, id: RefIdentity) -> Result<()> {
        if id.is_data() != record.item.is_data() {
            return Err(FxtError::corruption(
                record.key.objectid,
                format!("{id:?} does not fit extent flags {:#x}", record.item.flags),
            ));
        }
        Ok(())
    }

    // ── Reference mutations ─────────────────────────────────────────────────

    /// Add `count` references held by `id`.
    ///
    /// The ref goes inline when it already is, or when the item has room and
    /// the extent has no standalone refs; otherwise it is a standalone record.
    /// Returns the extent's new ref count.
    pub fn inc_extent_ref(
        &self,
        target: ExtentTarget,
        id: RefIdentity,
        count: u32,
        op: Option<&ExtentOp>,
    ) -> Result<u64> {
        let bytenr = target.bytenr;
        if count == 0 {
            return Err(FxtError::InvalidArgument(format!("zero-count ref on {bytenr}")));
        }
        let record = self
            .lookup_extent(target)?
            .ok_or_else(|| FxtError::corruption(bytenr, "adding a reference to a missing extent item"))?;
        Self::check_kind(&record, id)?;
        let room = InsertRoom {
            max_item_size: self.max_item_size(),
            keyed_refs_present: has_keyed_refs(self.store.as_ref(), bytenr)?,
        };
        match lookup_inline_backref(&record.item, id, Some(room)) {
            InlineLookup::Found(index) => {
                if !id.is_data() {
                    return Err(FxtError::corruption(bytenr, "adding refs to an existing tree backref"));
                }
                match self.update_inline_backref(&record, index, i64::from(count), op)? {
                    DropOutcome::Remaining { refs } => Ok(refs),
                    DropOutcome::Removed { .. } => Ok(0),
                }
            }
            InlineLookup::NotFound(slot) => self.insert_inline_backref(&record, slot, id, count, op),
            InlineLookup::TooLarge => {
                let mut item = record.item.clone();
                item.refs = item
                    .refs
                    .checked_add(u64::from(count))
                    .ok_or_else(|| FxtError::corruption(bytenr, "extent refs overflow"))?;
                apply_op(&mut item, op);
                insert_standalone_backref(self.store.as_ref(), bytenr, id, count)?;
                self.write_header(&record.key, &item)?;
                trace!(bytenr, ?id, count, refs = item.refs, "keyed backref added");
                Ok(item.refs)
            }
        }
    }

    /// Drop `count` references held by `id`.
    ///
    /// Dropping more refs than the extent or the backref holds is corruption.
    pub fn free_extent(
        &self,
        target: ExtentTarget,
        id: RefIdentity,
        count: u32,
        op: Option<&ExtentOp>,
    ) -> Result<DropOutcome> {
        let bytenr = target.bytenr;
        let record = self
            .lookup_extent(target)?
            .ok_or_else(|| FxtError::corruption(bytenr, "dropping a reference to a missing extent item"))?;
        Self::check_kind(&record, id)?;
        if record.item.refs < u64::from(count) {
            return Err(FxtError::corruption(
                bytenr,
                format!("dropping {count} refs from an extent holding {}", record.item.refs),
            ));
        }
        if let InlineLookup::Found(index) = lookup_inline_backref(&record.item, id, None) {
            return self.update_inline_backref(&record, index, -i64::from(count), op);
        }
        let found = lookup_standalone_backref(self.store.as_ref(), bytenr, id)?
            .ok_or_else(|| FxtError::corruption(bytenr, format!("no back-reference for {id:?}")))?;
        if found.count < count {
            return Err(FxtError::corruption(
                bytenr,
                format!("dropping {count} refs from a backref holding {}", found.count),
            ));
        }
        if record.item.refs == u64::from(count) {
            return self.remove_extent(&record, None, Some(&found));
        }
        remove_standalone_backref(self.store.as_ref(), &found, count)?;
        let mut item = record.item.clone();
        item.refs -= u64::from(count);
        apply_op(&mut item, op);
        self.write_header(&record.key, &item)?;
        trace!(bytenr, ?id, count, refs = item.refs, "keyed backref dropped");
        Ok(DropOutcome::Remaining { refs: item.refs })
    }

    /// Apply a flag or first-key update to an existing extent item.
    pub fn apply_extent_op(&self, target: ExtentTarget, op: &ExtentOp) -> Result<()> {
        let record = self
            .lookup_extent(target)?
            .ok_or_else(|| FxtError::corruption(target.bytenr, "extent op for a missing extent item"))?;
        let mut item = record.item.clone();
        apply_op(&mut item, Some(op));
        self.write_header(&record.key, &item)?;
        trace!(bytenr = target.bytenr, flags = item.flags, "extent op applied");
        Ok(())
    }

    // ── Consistency ─────────────────────────────────────────────────────────

    /// Inline refs followed by standalone refs of `record`.
    pub fn backrefs(&self, record: &ExtentRecord) -> Result<Vec<Backref>> {
        let mut out: Vec<Backref> = record
            .item
            .inline
            .iter()
            .filter_map(|iref| {
                iref.identity().map(|id| Backref {
                    id,
                    count: iref.count(),
                    inline: true,
                })
            })
            .collect();
        out.extend(
            standalone_backrefs(self.store.as_ref(), record.key.objectid)?
                .into_iter()
                .map(|r| Backref {
                    id: r.id,
                    count: u64::from(r.count),
                    inline: false,
                }),
        );
        Ok(out)
    }

    /// Check that the extent's ref count equals the sum of its backrefs.
    pub fn verify_refs(&self, record: &ExtentRecord) -> Result<u64> {
        let counted: u64 = self.backrefs(record)?.iter().map(|b| b.count).sum();
        if counted != record.item.refs {
            return Err(FxtError::corruption(
                record.key.objectid,
                format!("extent holds {} refs but {counted} are backed", record.item.refs),
            ));
        }
        Ok(counted)
    }

    /// [`Self::verify_refs`] over every extent item; returns the item count.
    pub fn verify_all(&self) -> Result<usize> {
        let records = self.extent_records()?;
        for record in &records {
            self.verify_refs(record)?;
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxt_btree::MemItemStore;
    use fxt_types::BLOCK_FLAG_FULL_BACKREF;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    const BYTENR: u64 = 1 << 20;

    fn extents(nodesize: u32, skinny: bool) -> ExtentStore {
        ExtentStore::new(Arc::new(MemItemStore::new(nodesize)), 4096, skinny)
    }

    fn store_is_empty(ext: &ExtentStore) -> bool {
        ext.items()
            .items_in(&BtrfsKey::MIN, &BtrfsKey::MAX)
            .expect("scan")
            .is_empty()
    }

    fn data_id(root: u64, objectid: u64, offset: u64) -> RefIdentity {
        RefIdentity::ExtentData {
            root,
            objectid,
            offset,
        }
    }

    fn new_data(backref: RefIdentity, owner_root: Option<u64>) -> NewExtent {
        NewExtent {
            target: ExtentTarget::data(BYTENR, 4096),
            generation: 10,
            flags: 0,
            first_key: BtrfsKey::MIN,
            backref,
            refs: 1,
            owner_root,
        }
    }

    fn new_tree(level: u8, backref: RefIdentity) -> NewExtent {
        NewExtent {
            target: ExtentTarget::tree_block(BYTENR, 16_384, level),
            generation: 10,
            flags: 0,
            first_key: BtrfsKey::new(256, 1, 0),
            backref,
            refs: 1,
            owner_root: None,
        }
    }

    #[test]
    fn single_data_extent_lifecycle() {
        let ext = extents(16_384, true);
        let id = data_id(5, 257, 0);
        ext.insert_extent(&new_data(id, None)).expect("insert");
        let target = ExtentTarget::data(BYTENR, 4096);
        let record = ext.lookup_extent(target).expect("lookup").expect("present");
        assert_eq!(record.item.refs, 1);
        assert_eq!(
            record.item.inline,
            vec![InlineRef::ExtentData(crate::item::DataRef {
                root: 5,
                objectid: 257,
                offset: 0,
                count: 1,
            })]
        );
        assert_eq!(ext.verify_refs(&record).expect("verify"), 1);

        let outcome = ext.free_extent(target, id, 1, None).expect("drop");
        assert!(matches!(outcome, DropOutcome::Removed { .. }));
        assert!(store_is_empty(&ext));
    }

    #[test]
    fn inline_refs_stay_in_canonical_order() {
        let ext = extents(16_384, true);
        let target = ExtentTarget::data(BYTENR, 4096);
        ext.insert_extent(&new_data(data_id(5, 257, 0), None)).expect("insert");
        for objectid in 258..262 {
            ext.inc_extent_ref(target, data_id(5, objectid, 0), 1, None)
                .expect("inc");
        }
        ext.inc_extent_ref(target, RefIdentity::SharedData { parent: 1 << 30 }, 2, None)
            .expect("shared");
        let record = ext.lookup_extent(target).expect("lookup").expect("present");
        assert_eq!(record.item.refs, 7);
        let ids: Vec<RefIdentity> = record.item.inline.iter().filter_map(InlineRef::identity).collect();
        let mut sorted = ids.clone();
        sorted.sort_by(|a, b| a.canonical_cmp(*b));
        assert_eq!(ids, sorted);
        assert_eq!(ids.last(), Some(&RefIdentity::SharedData { parent: 1 << 30 }));
        // The stored bytes are exactly the canonical encoding.
        let stored = ext.items().get(&record.key).expect("get").expect("item");
        assert_eq!(stored, record.item.encode());
        assert_eq!(ext.verify_refs(&record).expect("verify"), 7);
    }

    #[test]
    fn repeated_identity_raises_the_inline_count() {
        let ext = extents(16_384, true);
        let target = ExtentTarget::data(BYTENR, 4096);
        let id = data_id(5, 257, 0);
        ext.insert_extent(&new_data(id, None)).expect("insert");
        assert_eq!(ext.inc_extent_ref(target, id, 3, None).expect("inc"), 4);
        let record = ext.lookup_extent(target).expect("lookup").expect("present");
        assert_eq!(record.item.inline.len(), 1);
        assert_eq!(record.item.inline[0].count(), 4);
        assert_eq!(
            ext.free_extent(target, id, 2, None).expect("drop"),
            DropOutcome::Remaining { refs: 2 }
        );
    }

    #[test]
    fn full_items_spill_to_keyed_refs_and_stay_keyed() {
        // 4 KiB nodes leave room for a 224 byte item: six data refs.
        let ext = extents(4096, true);
        let target = ExtentTarget::data(BYTENR, 4096);
        ext.insert_extent(&new_data(data_id(5, 257, 0), None)).expect("insert");
        for objectid in 258..264 {
            ext.inc_extent_ref(target, data_id(5, objectid, 0), 1, None)
                .expect("inc");
        }
        let record = ext.lookup_extent(target).expect("lookup").expect("present");
        assert_eq!(record.item.inline.len(), 6);
        assert_eq!(record.item.refs, 7);
        let keyed = standalone_backrefs(ext.items().as_ref(), BYTENR).expect("keyed");
        assert_eq!(keyed.len(), 1);

        // Room frees up, but new refs still go keyed.
        ext.free_extent(target, data_id(5, 257, 0), 1, None).expect("drop");
        ext.inc_extent_ref(target, data_id(6, 300, 0), 1, None).expect("inc");
        let keyed = standalone_backrefs(ext.items().as_ref(), BYTENR).expect("keyed");
        assert_eq!(keyed.len(), 2);
        let record = ext.lookup_extent(target).expect("lookup").expect("present");
        assert_eq!(ext.verify_refs(&record).expect("verify"), 7);
    }

    #[test]
    fn dropping_the_last_keyed_ref_removes_both_items() {
        let ext = extents(4096, true);
        let target = ExtentTarget::data(BYTENR, 4096);
        let first = data_id(5, 257, 0);
        ext.insert_extent(&new_data(first, None)).expect("insert");
        let keyed = RefIdentity::SharedData { parent: 1 << 22 };
        insert_standalone_backref(ext.items().as_ref(), BYTENR, keyed, 1).expect("keyed");
        let record = ext.lookup_extent(target).expect("lookup").expect("present");
        let mut item = record.item.clone();
        item.refs = 2;
        ext.items()
            .write_item(&record.key, 0, &item.encode_header())
            .expect("header");

        ext.free_extent(target, first, 1, None).expect("drop inline");
        let outcome = ext.free_extent(target, keyed, 1, None).expect("drop keyed");
        assert!(matches!(outcome, DropOutcome::Removed { .. }));
        assert!(store_is_empty(&ext));
    }

    #[test]
    fn skinny_lookup_falls_back_to_legacy_items() {
        let shared: Arc<dyn ItemStore> = Arc::new(MemItemStore::new(16_384));
        let legacy = ExtentStore::new(Arc::clone(&shared), 4096, false);
        let skinny = ExtentStore::new(shared, 4096, true);
        legacy
            .insert_extent(&new_tree(0, RefIdentity::TreeBlock { root: 5 }))
            .expect("insert");
        let record = skinny
            .lookup_extent(ExtentTarget::tree_block(BYTENR, 16_384, 0))
            .expect("lookup")
            .expect("present");
        assert_eq!(record.key.item_type, EXTENT_ITEM_KEY);
        assert_eq!(record.item.tree_block.map(|t| t.key), Some(BtrfsKey::new(256, 1, 0)));
        assert_eq!(record.num_bytes(16_384), 16_384);
    }

    #[test]
    fn shared_block_conversion() {
        let ext = extents(16_384, true);
        let target = ExtentTarget::tree_block(BYTENR, 16_384, 0);
        let owned = RefIdentity::TreeBlock { root: 5 };
        let shared = RefIdentity::SharedBlock { parent: 1 << 24 };
        let record = ext.insert_extent(&new_tree(0, owned)).expect("insert");
        assert_eq!(record.key.item_type, METADATA_ITEM_KEY);

        let snapshot = RefIdentity::TreeBlock { root: 256 };
        assert_eq!(ext.inc_extent_ref(target, snapshot, 1, None).expect("snapshot"), 2);
        ext.inc_extent_ref(target, shared, 1, None).expect("shared");
        ext.free_extent(target, owned, 1, None).expect("drop owned");
        ext.free_extent(target, snapshot, 1, None).expect("drop snapshot");
        ext.apply_extent_op(target, &ExtentOp::set_flags(BLOCK_FLAG_FULL_BACKREF))
            .expect("flags");

        let record = ext.lookup_extent(target).expect("lookup").expect("present");
        assert_eq!(record.item.refs, 1);
        assert_eq!(record.item.inline, vec![InlineRef::SharedBlock { parent: 1 << 24 }]);
        assert_ne!(record.item.flags & BLOCK_FLAG_FULL_BACKREF, 0);
    }

    #[test]
    fn owner_ref_leads_and_counts_nothing() {
        let ext = extents(16_384, true);
        let target = ExtentTarget::data(BYTENR, 4096);
        let id = data_id(5, 257, 0);
        let record = ext.insert_extent(&new_data(id, Some(5))).expect("insert");
        assert_eq!(record.item.owner_root(), Some(5));
        ext.inc_extent_ref(target, RefIdentity::SharedData { parent: 4096 }, 1, None)
            .expect("inc");
        let record = ext.lookup_extent(target).expect("lookup").expect("present");
        assert!(matches!(record.item.inline[0], InlineRef::Owner { root: 5 }));
        assert_eq!(ext.verify_refs(&record).expect("verify"), 2);

        ext.free_extent(target, RefIdentity::SharedData { parent: 4096 }, 1, None)
            .expect("drop shared");
        let outcome = ext.free_extent(target, id, 1, None).expect("drop last");
        assert_eq!(
            outcome,
            DropOutcome::Removed {
                flags: EXTENT_FLAG_DATA,
                owner_root: Some(5),
            }
        );
    }

    #[test]
    fn underflow_and_unknown_refs_are_corruption() {
        let ext = extents(16_384, true);
        let target = ExtentTarget::data(BYTENR, 4096);
        let id = data_id(5, 257, 0);
        ext.insert_extent(&new_data(id, None)).expect("insert");
        let over = ext.free_extent(target, id, 2, None).expect_err("underflow");
        assert!(matches!(over, FxtError::Corruption { block: BYTENR, .. }));
        let unknown = ext
            .free_extent(target, data_id(5, 999, 0), 1, None)
            .expect_err("unknown");
        assert!(unknown.is_transaction_fatal());
        let wrong_kind = ext
            .inc_extent_ref(target, RefIdentity::TreeBlock { root: 5 }, 1, None)
            .expect_err("kind");
        assert!(wrong_kind.is_transaction_fatal());
        let missing = ext
            .free_extent(ExtentTarget::data(BYTENR * 2, 4096), id, 1, None)
            .expect_err("missing");
        assert!(missing.is_transaction_fatal());
        assert!(ext.insert_extent(&new_data(id, None)).is_err());
    }

    #[derive(Debug, Clone)]
    enum RefOp {
        Add(usize, u32),
        Drop(usize, u32),
    }

    fn ref_op() -> impl Strategy<Value = RefOp> {
        prop_oneof![
            (0..10_usize, 1..4_u32).prop_map(|(who, n)| RefOp::Add(who, n)),
            (0..10_usize, 1..4_u32).prop_map(|(who, n)| RefOp::Drop(who, n)),
        ]
    }

    fn holder(index: usize) -> RefIdentity {
        let index = index as u64;
        if index % 3 == 0 {
            RefIdentity::SharedData {
                parent: (index + 1) << 20,
            }
        } else {
            data_id(5 + index % 2, 257 + index, index * 4096)
        }
    }

    proptest! {
        #[test]
        fn refs_always_match_backrefs(ops in proptest::collection::vec(ref_op(), 1..60)) {
            let ext = extents(4096, true);
            let target = ExtentTarget::data(BYTENR, 4096);
            let mut model: BTreeMap<RefIdentity, u64> = BTreeMap::new();
            ext.insert_extent(&new_data(holder(0), None)).expect("insert");
            model.insert(holder(0), 1);

            for op in ops {
                let total: u64 = model.values().sum();
                match op {
                    RefOp::Add(who, n) => {
                        if total == 0 {
                            continue;
                        }
                        ext.inc_extent_ref(target, holder(who), n, None).expect("inc");
                        *model.entry(holder(who)).or_default() += u64::from(n);
                    }
                    RefOp::Drop(who, n) => {
                        let held = model.get(&holder(who)).copied().unwrap_or(0);
                        if held < u64::from(n) {
                            continue;
                        }
                        let outcome = ext.free_extent(target, holder(who), n, None).expect("drop");
                        let left = held - u64::from(n);
                        if left == 0 {
                            model.remove(&holder(who));
                        } else {
                            model.insert(holder(who), left);
                        }
                        let total: u64 = model.values().sum();
                        prop_assert_eq!(matches!(outcome, DropOutcome::Removed { .. }), total == 0);
                    }
                }
                match ext.lookup_extent(target).expect("lookup") {
                    Some(record) => {
                        prop_assert_eq!(ext.verify_refs(&record).expect("verify"), model.values().sum::<u64>());
                        let mut seen: BTreeMap<RefIdentity, u64> = BTreeMap::new();
                        for backref in ext.backrefs(&record).expect("backrefs") {
                            *seen.entry(backref.id).or_default() += backref.count;
                        }
                        prop_assert_eq!(&seen, &model);
                    }
                    None => prop_assert!(model.is_empty()),
                }
            }
        }
    }
}
