//! References a tree block holds on its children.

use crate::block::{FileExtent, TreeBlock};
use fxt_error::{FxtError, Result};
use fxt_types::EXTENT_DATA_KEY;
use serde::Serialize;

/// Direction of a queued reference change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefChange {
    Add,
    Drop,
}

/// One reference from a tree block to a child extent.
///
/// `parent` is non-zero for full (shared) back-references. For tree blocks
/// `owner` is the child level; for data it is the inode number and `offset`
/// is the file offset the extent is logically mapped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRef {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub parent: u64,
    pub root: u64,
    pub owner: u64,
    pub offset: u64,
    pub is_data: bool,
}

/// Every reference `block` holds on its children.
///
/// With `full_backref` the references are keyed by the block's bytenr;
/// otherwise by its owning root.
pub fn child_refs(block: &TreeBlock, full_backref: bool, nodesize: u32) -> Result<Vec<BlockRef>> {
    let parent = if full_backref { block.bytenr } else { 0 };
    let root = block.owner;
    if block.is_leaf() {
        let mut refs = Vec::new();
        for item in block.items() {
            if item.key.item_type != EXTENT_DATA_KEY {
                continue;
            }
            let extent = FileExtent::parse(&item.data)
                .map_err(|err| FxtError::corruption(block.bytenr, err.to_string()))?;
            if !extent.references_extent() {
                continue;
            }
            refs.push(BlockRef {
                bytenr: extent.disk_bytenr,
                num_bytes: extent.disk_num_bytes,
                parent,
                root,
                owner: item.key.objectid,
                offset: item.key.offset.wrapping_sub(extent.offset),
                is_data: true,
            });
        }
        return Ok(refs);
    }
    let child_level = u64::from(block.level - 1);
    Ok(block
        .ptrs()
        .iter()
        .map(|ptr| BlockRef {
            bytenr: ptr.blockptr,
            num_bytes: u64::from(nodesize),
            parent,
            root,
            owner: child_level,
            offset: 0,
            is_data: false,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{LeafItem, NodePtr};
    use fxt_types::BtrfsKey;

    #[test]
    fn leaf_refs_skip_holes_and_inline_items() {
        let mut inline = FileExtent::regular(1, 0, 0, 0);
        inline.kind = crate::block::FILE_EXTENT_INLINE;
        let items = vec![
            LeafItem {
                key: BtrfsKey::new(257, 1, 0),
                data: vec![0; 160],
            },
            LeafItem {
                key: BtrfsKey::new(257, EXTENT_DATA_KEY, 0),
                data: inline.encode(),
            },
            LeafItem {
                key: BtrfsKey::new(257, EXTENT_DATA_KEY, 4096),
                data: FileExtent::regular(1, 0, 0, 0).encode(),
            },
            LeafItem {
                key: BtrfsKey::new(257, EXTENT_DATA_KEY, 12288),
                data: FileExtent::regular(1, 1 << 20, 16384, 4096).encode(),
            },
        ];
        let leaf = TreeBlock::leaf(1 << 30, 1, 5, items);
        let refs = child_refs(&leaf, false, 4096).expect("refs");
        assert_eq!(
            refs,
            vec![BlockRef {
                bytenr: 1 << 20,
                num_bytes: 16384,
                parent: 0,
                root: 5,
                owner: 257,
                offset: 8192,
                is_data: true,
            }]
        );
    }

    #[test]
    fn full_backref_keys_children_by_parent() {
        let ptrs = vec![NodePtr {
            key: BtrfsKey::new(256, 1, 0),
            blockptr: 1 << 20,
            generation: 1,
        }];
        let node = TreeBlock::node(1 << 30, 1, 5, 2, ptrs);
        let refs = child_refs(&node, true, 16384).expect("refs");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].parent, 1 << 30);
        assert_eq!(refs[0].owner, 1);
        assert_eq!(refs[0].num_bytes, 16384);
        assert!(!refs[0].is_data);
    }
}
