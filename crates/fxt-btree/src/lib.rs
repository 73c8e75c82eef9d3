#![forbid(unsafe_code)]
//! Ordered keyed item store.
//!
//! The extent engine persists extent items and standalone back-references in
//! a B-tree it does not own. This crate pins down the contract the engine
//! consumes from that tree ([`ItemStore`]): keyed search, insertion of
//! zero-filled items, in-place writes, growing and shrinking an item, deletion,
//! and ordered iteration.
//!
//! [`MemItemStore`] is the in-memory implementation used by tests, the
//! harness, and any embedder that keeps the extent tree resident. It enforces
//! the leaf-size limit of the configured node size so item growth fails the
//! same way it would against a real tree.
//!
//! Every mutation bumps a store-wide version counter. Readers that need a
//! consistent view across the store and another lock (the delayed-ref head
//! mutex) read the version, do their work, and retry if it moved.

use fxt_error::{FxtError, Result};
use fxt_types::{BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BtrfsKey};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

// ── Contract ────────────────────────────────────────────────────────────────

/// How [`ItemStore::search`] resolves a key that is not present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Only an item with exactly this key.
    Exact,
    /// The first item whose key is `>=` the search key.
    NextGe,
    /// The last item whose key is `<=` the search key.
    PrevLe,
}

/// One stored item: key plus owned copy of its bytes.
pub type Item = (BtrfsKey, Vec<u8>);

/// The keyed store the extent engine mutates.
///
/// Implementations serialize mutations internally; each call is atomic with
/// respect to every other call on the same store.
pub trait ItemStore: Send + Sync {
    /// Node size of the backing tree, in bytes.
    fn nodesize(&self) -> u32;

    /// Counter bumped by every successful mutation.
    fn version(&self) -> u64;

    fn search(&self, key: &BtrfsKey, mode: SearchMode) -> Result<Option<Item>>;

    /// Insert a zero-filled item of `size` bytes.
    ///
    /// Fails with `Exists` if `key` is already present.
    fn insert_empty_item(&self, key: BtrfsKey, size: usize) -> Result<()>;

    /// Overwrite `data.len()` bytes of an existing item starting at `offset`.
    fn write_item(&self, key: &BtrfsKey, offset: usize, data: &[u8]) -> Result<()>;

    /// Grow an item by `extra` zero bytes at its end.
    fn extend_item(&self, key: &BtrfsKey, extra: usize) -> Result<()>;

    /// Shrink an item to `new_size` bytes, dropping its tail.
    fn truncate_item(&self, key: &BtrfsKey, new_size: usize) -> Result<()>;

    /// Delete every listed item. All keys must exist; nothing is deleted
    /// otherwise.
    fn del_items(&self, keys: &[BtrfsKey]) -> Result<()>;

    /// Items with `start <= key <= end`, in key order.
    fn items_in(&self, start: &BtrfsKey, end: &BtrfsKey) -> Result<Vec<Item>>;

    /// Largest item a leaf can hold.
    fn max_item_size(&self) -> usize {
        (self.nodesize() as usize)
            .saturating_sub(BTRFS_HEADER_SIZE as usize)
            .saturating_sub(BTRFS_ITEM_SIZE as usize)
    }

    fn get(&self, key: &BtrfsKey) -> Result<Option<Vec<u8>>> {
        Ok(self.search(key, SearchMode::Exact)?.map(|(_, data)| data))
    }

    /// First item strictly after `key`.
    fn next(&self, key: &BtrfsKey) -> Result<Option<Item>> {
        match key.successor() {
            Some(succ) => self.search(&succ, SearchMode::NextGe),
            None => Ok(None),
        }
    }

    fn insert_item(&self, key: BtrfsKey, data: &[u8]) -> Result<()> {
        self.insert_empty_item(key, data.len())?;
        self.write_item(&key, 0, data)
    }

    fn del_item(&self, key: &BtrfsKey) -> Result<()> {
        self.del_items(std::slice::from_ref(key))
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// Resident keyed store backed by a `BTreeMap`.
#[derive(Debug)]
pub struct MemItemStore {
    nodesize: u32,
    items: RwLock<BTreeMap<BtrfsKey, Vec<u8>>>,
    version: AtomicU64,
    read_fault: Mutex<Option<i32>>,
}

impl MemItemStore {
    #[must_use]
    pub fn new(nodesize: u32) -> Self {
        Self {
            nodesize,
            items: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            read_fault: Mutex::new(None),
        }
    }

    /// Make every later read fail with the raw os error `errno`.
    ///
    /// `None` clears the fault.
    pub fn fail_reads_with(&self, errno: Option<i32>) {
        *self.read_fault.lock() = errno;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Full copy of the store contents, in key order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Item> {
        self.items
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    fn check_read(&self) -> Result<()> {
        match *self.read_fault.lock() {
            Some(errno) => Err(FxtError::Io(std::io::Error::from_raw_os_error(errno))),
            None => Ok(()),
        }
    }

    fn check_size(&self, key: &BtrfsKey, size: usize) -> Result<()> {
        if size > self.max_item_size() {
            return Err(FxtError::InvalidArgument(format!(
                "item {key} of {size} bytes exceeds leaf capacity {}",
                self.max_item_size()
            )));
        }
        Ok(())
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

fn missing(key: &BtrfsKey) -> FxtError {
    FxtError::NotFound(format!("item {key}"))
}

impl ItemStore for MemItemStore {
    fn nodesize(&self) -> u32 {
        self.nodesize
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn search(&self, key: &BtrfsKey, mode: SearchMode) -> Result<Option<Item>> {
        self.check_read()?;
        let items = self.items.read();
        let hit = match mode {
            SearchMode::Exact => items.get_key_value(key),
            SearchMode::NextGe => items.range((Bound::Included(*key), Bound::Unbounded)).next(),
            SearchMode::PrevLe => items.range(..=*key).next_back(),
        };
        Ok(hit.map(|(k, v)| (*k, v.clone())))
    }

    fn insert_empty_item(&self, key: BtrfsKey, size: usize) -> Result<()> {
        self.check_size(&key, size)?;
        let mut items = self.items.write();
        if items.contains_key(&key) {
            return Err(FxtError::Exists(format!("item {key}")));
        }
        items.insert(key, vec![0; size]);
        self.bump();
        trace!(%key, size, "insert_empty_item");
        Ok(())
    }

    fn write_item(&self, key: &BtrfsKey, offset: usize, data: &[u8]) -> Result<()> {
        let mut items = self.items.write();
        let item = items.get_mut(key).ok_or_else(|| missing(key))?;
        let len = item.len();
        let slot = offset
            .checked_add(data.len())
            .and_then(|end| item.get_mut(offset..end))
            .ok_or_else(|| {
                FxtError::InvalidArgument(format!(
                    "write of {} bytes at {offset} overruns item {key} of {len} bytes",
                    data.len()
                ))
            })?;
        slot.copy_from_slice(data);
        self.bump();
        Ok(())
    }

    fn extend_item(&self, key: &BtrfsKey, extra: usize) -> Result<()> {
        let mut items = self.items.write();
        let item = items.get_mut(key).ok_or_else(|| missing(key))?;
        let new_size = item.len().saturating_add(extra);
        self.check_size(key, new_size)?;
        item.resize(new_size, 0);
        self.bump();
        trace!(%key, new_size, "extend_item");
        Ok(())
    }

    fn truncate_item(&self, key: &BtrfsKey, new_size: usize) -> Result<()> {
        let mut items = self.items.write();
        let item = items.get_mut(key).ok_or_else(|| missing(key))?;
        if new_size > item.len() {
            return Err(FxtError::InvalidArgument(format!(
                "truncate of item {key} to {new_size} bytes would grow it from {}",
                item.len()
            )));
        }
        item.truncate(new_size);
        self.bump();
        trace!(%key, new_size, "truncate_item");
        Ok(())
    }

    fn del_items(&self, keys: &[BtrfsKey]) -> Result<()> {
        let mut items = self.items.write();
        if let Some(absent) = keys.iter().find(|k| !items.contains_key(k)) {
            return Err(missing(absent));
        }
        for key in keys {
            items.remove(key);
            trace!(%key, "del_item");
        }
        self.bump();
        Ok(())
    }

    fn items_in(&self, start: &BtrfsKey, end: &BtrfsKey) -> Result<Vec<Item>> {
        self.check_read()?;
        if start > end {
            return Ok(Vec::new());
        }
        let items = self.items.read();
        Ok(items
            .range(*start..=*end)
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxt_types::{EXTENT_DATA_REF_KEY, EXTENT_ITEM_KEY, METADATA_ITEM_KEY, TREE_BLOCK_REF_KEY};
    use proptest::prelude::*;

    fn key(objectid: u64, item_type: u8, offset: u64) -> BtrfsKey {
        BtrfsKey::new(objectid, item_type, offset)
    }

    #[test]
    fn search_modes_resolve_neighbours() {
        let store = MemItemStore::new(16_384);
        store.insert_item(key(4096, EXTENT_ITEM_KEY, 4096), &[1]).unwrap();
        store.insert_item(key(8192, METADATA_ITEM_KEY, 0), &[2]).unwrap();

        let probe = key(4096, EXTENT_ITEM_KEY, u64::MAX);
        assert_eq!(store.search(&probe, SearchMode::Exact).unwrap(), None);
        assert_eq!(
            store.search(&probe, SearchMode::PrevLe).unwrap(),
            Some((key(4096, EXTENT_ITEM_KEY, 4096), vec![1]))
        );
        assert_eq!(
            store.search(&probe, SearchMode::NextGe).unwrap(),
            Some((key(8192, METADATA_ITEM_KEY, 0), vec![2]))
        );
        assert_eq!(
            store.next(&key(4096, EXTENT_ITEM_KEY, 4096)).unwrap().map(|(k, _)| k),
            Some(key(8192, METADATA_ITEM_KEY, 0))
        );
        assert_eq!(store.next(&key(8192, METADATA_ITEM_KEY, 0)).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = MemItemStore::new(4096);
        let k = key(1, TREE_BLOCK_REF_KEY, 5);
        store.insert_empty_item(k, 0).unwrap();
        assert!(matches!(store.insert_empty_item(k, 0), Err(FxtError::Exists(_))));
    }

    #[test]
    fn extend_write_truncate_in_place() {
        let store = MemItemStore::new(4096);
        let k = key(1, EXTENT_ITEM_KEY, 4096);
        store.insert_item(k, &[1, 2, 3]).unwrap();
        store.extend_item(&k, 2).unwrap();
        assert_eq!(store.get(&k).unwrap(), Some(vec![1, 2, 3, 0, 0]));
        store.write_item(&k, 3, &[9, 9]).unwrap();
        store.truncate_item(&k, 4).unwrap();
        assert_eq!(store.get(&k).unwrap(), Some(vec![1, 2, 3, 9]));
        assert!(store.write_item(&k, 3, &[1, 1]).is_err());
        assert!(store.truncate_item(&k, 10).is_err());
    }

    #[test]
    fn leaf_capacity_bounds_item_growth() {
        let store = MemItemStore::new(4096);
        assert_eq!(store.max_item_size(), 4096 - 101 - 25);
        let k = key(1, EXTENT_ITEM_KEY, 4096);
        store.insert_empty_item(k, store.max_item_size()).unwrap();
        assert!(matches!(
            store.extend_item(&k, 1),
            Err(FxtError::InvalidArgument(_))
        ));
        assert!(store.insert_empty_item(key(2, EXTENT_ITEM_KEY, 1), 4096).is_err());
    }

    #[test]
    fn del_items_is_all_or_nothing() {
        let store = MemItemStore::new(4096);
        let a = key(1, EXTENT_DATA_REF_KEY, 10);
        let b = key(1, EXTENT_DATA_REF_KEY, 11);
        store.insert_item(a, &[0; 28]).unwrap();
        assert!(matches!(store.del_items(&[a, b]), Err(FxtError::NotFound(_))));
        assert_eq!(store.len(), 1);
        store.del_item(&a).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn version_moves_only_on_mutation() {
        let store = MemItemStore::new(4096);
        let k = key(1, EXTENT_ITEM_KEY, 4096);
        let v0 = store.version();
        store.insert_item(k, &[1]).unwrap();
        let v1 = store.version();
        assert!(v1 > v0);
        store.get(&k).unwrap();
        store.items_in(&BtrfsKey::MIN, &BtrfsKey::MAX).unwrap();
        assert_eq!(store.version(), v1);
        assert!(store.write_item(&k, 5, &[1]).is_err());
        assert_eq!(store.version(), v1);
    }

    #[test]
    fn read_fault_surfaces_as_io() {
        let store = MemItemStore::new(4096);
        store.fail_reads_with(Some(5));
        let err = store.get(&BtrfsKey::MIN).unwrap_err();
        assert_eq!(err.to_errno(), 5);
        store.fail_reads_with(None);
        assert_eq!(store.get(&BtrfsKey::MIN).unwrap(), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, u8),
        Extend(u8, u8),
        Truncate(u8, u8),
        Delete(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u8..32, 0_u8..64).prop_map(|(k, n)| Op::Insert(k, n)),
            (0_u8..32, 0_u8..16).prop_map(|(k, n)| Op::Extend(k, n)),
            (0_u8..32, 0_u8..64).prop_map(|(k, n)| Op::Truncate(k, n)),
            (0_u8..32).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn store_matches_reference_model(ops in proptest::collection::vec(op_strategy(), 1..120)) {
            let store = MemItemStore::new(4096);
            let mut model = BTreeMap::<BtrfsKey, Vec<u8>>::new();
            for op in ops {
                match op {
                    Op::Insert(k, n) => {
                        let k = key(u64::from(k) * 4096, EXTENT_ITEM_KEY, 4096);
                        let res = store.insert_item(k, &vec![n; usize::from(n)]);
                        prop_assert_eq!(res.is_ok(), !model.contains_key(&k));
                        model.entry(k).or_insert_with(|| vec![n; usize::from(n)]);
                    }
                    Op::Extend(k, n) => {
                        let k = key(u64::from(k) * 4096, EXTENT_ITEM_KEY, 4096);
                        let res = store.extend_item(&k, usize::from(n));
                        match model.get_mut(&k) {
                            Some(item) => {
                                prop_assert!(res.is_ok());
                                item.resize(item.len() + usize::from(n), 0);
                            }
                            None => prop_assert!(res.is_err()),
                        }
                    }
                    Op::Truncate(k, n) => {
                        let k = key(u64::from(k) * 4096, EXTENT_ITEM_KEY, 4096);
                        let res = store.truncate_item(&k, usize::from(n));
                        match model.get_mut(&k) {
                            Some(item) if item.len() >= usize::from(n) => {
                                prop_assert!(res.is_ok());
                                item.truncate(usize::from(n));
                            }
                            _ => prop_assert!(res.is_err()),
                        }
                    }
                    Op::Delete(k) => {
                        let k = key(u64::from(k) * 4096, EXTENT_ITEM_KEY, 4096);
                        let res = store.del_item(&k);
                        prop_assert_eq!(res.is_ok(), model.remove(&k).is_some());
                    }
                }
            }
            let expected: Vec<Item> = model.into_iter().collect();
            prop_assert_eq!(store.snapshot(), expected);
        }
    }
}
