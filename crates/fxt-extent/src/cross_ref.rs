//! Whether a data extent is referenced by anyone but one file offset.
//!
//! Only the committed extent tree is consulted here; queued delayed refs are
//! checked by the caller. The answer may be a false "shared", never a false
//! "exclusive".

use crate::item::InlineRef;
use crate::store::ExtentStore;
use fxt_btree::SearchMode;
use fxt_error::Result;
use fxt_types::{BtrfsKey, EXTENT_ITEM_KEY};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// The parts of a subvolume root the check depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRef {
    pub objectid: u64,
    /// Generation of the newest snapshot taken of this root.
    pub last_snapshot: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommittedRef {
    /// The only reference is the queried `(root, objectid, offset)`.
    Exclusive,
    Shared,
    /// No extent item starts at the bytenr.
    Missing,
}

impl ExtentStore {
    /// Check the committed refs of the data extent at `bytenr` against the
    /// file extent `(root, objectid, offset)`.
    ///
    /// Without `strict`, an extent no newer than the root's last snapshot is
    /// reported shared without looking at its refs.
    pub fn check_committed_ref(
        &self,
        root: RootRef,
        objectid: u64,
        offset: u64,
        bytenr: u64,
        strict: bool,
    ) -> Result<CommittedRef> {
        let probe = BtrfsKey::new(bytenr, EXTENT_ITEM_KEY, u64::MAX);
        let Some((key, data)) = self.items().search(&probe, SearchMode::PrevLe)? else {
            return Ok(CommittedRef::Missing);
        };
        if key.objectid != bytenr || key.item_type != EXTENT_ITEM_KEY {
            return Ok(CommittedRef::Missing);
        }
        let item = self.decode(key, &data)?.item;

        let refs: Vec<&InlineRef> = item
            .inline
            .iter()
            .filter(|iref| !matches!(iref, InlineRef::Owner { .. }))
            .collect();
        let verdict = match refs.as_slice() {
            [InlineRef::ExtentData(data_ref)]
                if (strict || item.generation > root.last_snapshot)
                    && item.refs == u64::from(data_ref.count)
                    && data_ref.matches(root.objectid, objectid, offset) =>
            {
                CommittedRef::Exclusive
            }
            _ => CommittedRef::Shared,
        };
        trace!(bytenr, root = root.objectid, objectid, offset, ?verdict, "committed ref check");
        Ok(verdict)
    }
}
