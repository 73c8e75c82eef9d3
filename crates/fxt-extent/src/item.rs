//! Extent item codec.
//!
//! An extent item is stored under `(bytenr, EXTENT_ITEM, num_bytes)` or, for
//! skinny tree blocks, `(bytenr, METADATA_ITEM, level)`:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 8 | refs |
//! | 8 | 8 | generation |
//! | 16 | 8 | flags |
//! | 24 | 18 | first key + level (legacy tree blocks only) |
//! | .. | .. | inline refs |
//!
//! Each inline ref is a one-byte type followed by its body:
//!
//! | Type | Body |
//! |------|------|
//! | `EXTENT_OWNER_REF` | root (8) |
//! | `TREE_BLOCK_REF` | root (8) |
//! | `SHARED_BLOCK_REF` | parent (8) |
//! | `EXTENT_DATA_REF` | root (8), objectid (8), offset (8), count (4) |
//! | `SHARED_DATA_REF` | parent (8), count (4) |

use crate::backref::RefIdentity;
use fxt_error::{FxtError, Result};
use fxt_types::{
    BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BtrfsKey, EXTENT_DATA_REF_KEY, EXTENT_FLAG_DATA,
    EXTENT_FLAG_TREE_BLOCK, EXTENT_ITEM_KEY, EXTENT_OWNER_REF_KEY, METADATA_ITEM_KEY, ParseError,
    SHARED_BLOCK_REF_KEY, SHARED_DATA_REF_KEY, TREE_BLOCK_REF_KEY, hash_extent_data_ref,
    read_le_u32, read_le_u64, read_u8,
};
use serde::{Deserialize, Serialize};

pub const EXTENT_ITEM_HEADER_SIZE: usize = 24;
pub const TREE_BLOCK_INFO_SIZE: usize = BtrfsKey::DISK_SIZE + 1;
/// Body of an `EXTENT_DATA_REF`, inline or standalone.
pub const DATA_REF_SIZE: usize = 28;
/// Body of a standalone `SHARED_DATA_REF` record.
pub const SHARED_DATA_REF_SIZE: usize = 4;

/// Largest size an extent item may grow to by inline-ref insertion.
#[must_use]
pub fn max_extent_item_size(nodesize: u32) -> usize {
    let leaf_data = nodesize.saturating_sub(BTRFS_HEADER_SIZE) as usize;
    (leaf_data >> 4).saturating_sub(BTRFS_ITEM_SIZE as usize)
}

/// Encoded size of an inline ref of `item_type`, type byte included.
#[must_use]
pub fn inline_ref_size(item_type: u8) -> usize {
    match item_type {
        EXTENT_DATA_REF_KEY => 1 + DATA_REF_SIZE,
        SHARED_DATA_REF_KEY => 1 + 8 + 4,
        _ => 1 + 8,
    }
}

/// Turns codec errors into corruption of the extent at `bytenr`.
pub trait ParseResultExt<T> {
    fn at_bytenr(self, bytenr: u64) -> Result<T>;
}

impl<T> ParseResultExt<T> for std::result::Result<T, ParseError> {
    fn at_bytenr(self, bytenr: u64) -> Result<T> {
        self.map_err(|err| FxtError::corruption(bytenr, err.to_string()))
    }
}

// ── Data refs ───────────────────────────────────────────────────────────────

/// A file extent reference: `count` file items of `(root, objectid)` at
/// `offset` point at the extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRef {
    pub root: u64,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

impl DataRef {
    #[must_use]
    pub fn hash(&self) -> u64 {
        hash_extent_data_ref(self.root, self.objectid, self.offset)
    }

    #[must_use]
    pub fn matches(&self, root: u64, objectid: u64, offset: u64) -> bool {
        self.root == root && self.objectid == objectid && self.offset == offset
    }

    pub fn decode(data: &[u8], at: usize) -> std::result::Result<Self, ParseError> {
        let count = read_le_u32(data, at + 24)?;
        if count == 0 {
            return Err(ParseError::InvalidField {
                field: "data_ref_count",
                reason: "data ref with zero count",
            });
        }
        Ok(Self {
            root: read_le_u64(data, at)?,
            objectid: read_le_u64(data, at + 8)?,
            offset: read_le_u64(data, at + 16)?,
            count,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.root.to_le_bytes());
        out.extend_from_slice(&self.objectid.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DATA_REF_SIZE);
        self.encode_into(&mut out);
        out
    }
}

// ── Inline refs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InlineRef {
    /// Root that owns a data extent for quota purposes. Carries no count.
    Owner { root: u64 },
    TreeBlock { root: u64 },
    SharedBlock { parent: u64 },
    ExtentData(DataRef),
    SharedData { parent: u64, count: u32 },
}

impl InlineRef {
    #[must_use]
    pub fn item_type(&self) -> u8 {
        match self {
            Self::Owner { .. } => EXTENT_OWNER_REF_KEY,
            Self::TreeBlock { .. } => TREE_BLOCK_REF_KEY,
            Self::SharedBlock { .. } => SHARED_BLOCK_REF_KEY,
            Self::ExtentData(_) => EXTENT_DATA_REF_KEY,
            Self::SharedData { .. } => SHARED_DATA_REF_KEY,
        }
    }

    #[must_use]
    pub fn encoded_size(&self) -> usize {
        inline_ref_size(self.item_type())
    }

    /// References this inline ref accounts for.
    #[must_use]
    pub fn count(&self) -> u64 {
        match self {
            Self::Owner { .. } => 0,
            Self::TreeBlock { .. } | Self::SharedBlock { .. } => 1,
            Self::ExtentData(data) => u64::from(data.count),
            Self::SharedData { count, .. } => u64::from(*count),
        }
    }

    /// Byte offset of the count field inside the encoded ref.
    #[must_use]
    pub(crate) fn count_offset(&self) -> Option<usize> {
        match self {
            Self::ExtentData(_) => Some(1 + 24),
            Self::SharedData { .. } => Some(1 + 8),
            _ => None,
        }
    }

    #[must_use]
    pub fn identity(&self) -> Option<RefIdentity> {
        match *self {
            Self::Owner { .. } => None,
            Self::TreeBlock { root } => Some(RefIdentity::TreeBlock { root }),
            Self::SharedBlock { parent } => Some(RefIdentity::SharedBlock { parent }),
            Self::ExtentData(data) => Some(RefIdentity::ExtentData {
                root: data.root,
                objectid: data.objectid,
                offset: data.offset,
            }),
            Self::SharedData { parent, .. } => Some(RefIdentity::SharedData { parent }),
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.item_type());
        match self {
            Self::Owner { root } | Self::TreeBlock { root } => {
                out.extend_from_slice(&root.to_le_bytes());
            }
            Self::SharedBlock { parent } => out.extend_from_slice(&parent.to_le_bytes()),
            Self::ExtentData(data) => data.encode_into(out),
            Self::SharedData { parent, count } => {
                out.extend_from_slice(&parent.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
        }
    }

    /// Decode the ref at `at`, rejecting types that cannot appear on an
    /// extent with `flags`.
    pub fn decode(
        data: &[u8],
        at: usize,
        flags: u64,
        sectorsize: u64,
    ) -> std::result::Result<Self, ParseError> {
        let item_type = read_u8(data, at)?;
        let body = at + 1;
        let is_data = flags & EXTENT_FLAG_DATA != 0;
        let iref = match item_type {
            EXTENT_OWNER_REF_KEY if is_data => Self::Owner {
                root: read_le_u64(data, body)?,
            },
            TREE_BLOCK_REF_KEY if !is_data => Self::TreeBlock {
                root: read_le_u64(data, body)?,
            },
            SHARED_BLOCK_REF_KEY if !is_data => Self::SharedBlock {
                parent: aligned_parent(read_le_u64(data, body)?, sectorsize)?,
            },
            EXTENT_DATA_REF_KEY if is_data => Self::ExtentData(DataRef::decode(data, body)?),
            SHARED_DATA_REF_KEY if is_data => {
                let count = read_le_u32(data, body + 8)?;
                if count == 0 {
                    return Err(ParseError::InvalidField {
                        field: "shared_data_ref_count",
                        reason: "shared data ref with zero count",
                    });
                }
                Self::SharedData {
                    parent: aligned_parent(read_le_u64(data, body)?, sectorsize)?,
                    count,
                }
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "inline_ref_type",
                    reason: "unknown or misplaced inline ref type",
                });
            }
        };
        Ok(iref)
    }
}

fn aligned_parent(parent: u64, sectorsize: u64) -> std::result::Result<u64, ParseError> {
    if parent == 0 || parent % sectorsize.max(1) != 0 {
        return Err(ParseError::InvalidField {
            field: "parent",
            reason: "shared ref parent is not sector aligned",
        });
    }
    Ok(parent)
}

// ── Extent items ────────────────────────────────────────────────────────────

/// First key and level of a tree block, kept on legacy (non-skinny) items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBlockInfo {
    pub key: BtrfsKey,
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
    pub tree_block: Option<TreeBlockInfo>,
    pub inline: Vec<InlineRef>,
}

impl ExtentItem {
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.flags & EXTENT_FLAG_DATA != 0
    }

    #[must_use]
    pub fn is_tree_block(&self) -> bool {
        self.flags & EXTENT_FLAG_TREE_BLOCK != 0
    }

    /// Bytes before the first inline ref.
    #[must_use]
    pub fn header_size(&self) -> usize {
        EXTENT_ITEM_HEADER_SIZE + self.tree_block.map_or(0, |_| TREE_BLOCK_INFO_SIZE)
    }

    #[must_use]
    pub fn encoded_size(&self) -> usize {
        self.header_size() + self.inline.iter().map(InlineRef::encoded_size).sum::<usize>()
    }

    /// Byte offset of inline ref `index` (or of the end, for `index == len`).
    #[must_use]
    pub fn inline_offset(&self, index: usize) -> usize {
        self.header_size()
            + self.inline[..index.min(self.inline.len())]
                .iter()
                .map(InlineRef::encoded_size)
                .sum::<usize>()
    }

    /// Σ of the counts carried inline.
    #[must_use]
    pub fn inline_refs(&self) -> u64 {
        self.inline.iter().map(InlineRef::count).sum()
    }

    #[must_use]
    pub fn owner_root(&self) -> Option<u64> {
        match self.inline.first() {
            Some(InlineRef::Owner { root }) => Some(*root),
            _ => None,
        }
    }

    #[must_use]
    pub fn encode_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_size());
        out.extend_from_slice(&self.refs.to_le_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        if let Some(info) = self.tree_block {
            out.extend_from_slice(&info.key.to_disk());
            out.push(info.level);
        }
        out
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_header();
        out.reserve(self.encoded_size() - out.len());
        for iref in &self.inline {
            iref.encode_into(&mut out);
        }
        out
    }

    /// Decode the item stored under `key`.
    pub fn decode(key: &BtrfsKey, data: &[u8], sectorsize: u64) -> std::result::Result<Self, ParseError> {
        let refs = read_le_u64(data, 0)?;
        let generation = read_le_u64(data, 8)?;
        let flags = read_le_u64(data, 16)?;
        if refs == 0 {
            return Err(ParseError::InvalidField {
                field: "refs",
                reason: "extent item with zero refs",
            });
        }
        let is_data = flags & EXTENT_FLAG_DATA != 0;
        let is_tree = flags & EXTENT_FLAG_TREE_BLOCK != 0;
        if is_data == is_tree {
            return Err(ParseError::InvalidField {
                field: "flags",
                reason: "extent must be exactly one of data or tree block",
            });
        }
        if key.item_type == METADATA_ITEM_KEY && !is_tree {
            return Err(ParseError::InvalidField {
                field: "flags",
                reason: "metadata item without the tree block flag",
            });
        }

        let mut pos = EXTENT_ITEM_HEADER_SIZE;
        let tree_block = if is_tree && key.item_type == EXTENT_ITEM_KEY {
            let info = TreeBlockInfo {
                key: BtrfsKey::from_disk(data, pos)?,
                level: read_u8(data, pos + BtrfsKey::DISK_SIZE)?,
            };
            pos += TREE_BLOCK_INFO_SIZE;
            Some(info)
        } else {
            None
        };

        let mut inline = Vec::new();
        while pos < data.len() {
            let iref = InlineRef::decode(data, pos, flags, sectorsize)?;
            if matches!(iref, InlineRef::Owner { .. }) && !inline.is_empty() {
                return Err(ParseError::InvalidField {
                    field: "inline_ref_type",
                    reason: "owner ref is not the first inline ref",
                });
            }
            pos += iref.encoded_size();
            inline.push(iref);
        }

        Ok(Self {
            refs,
            generation,
            flags,
            tree_block,
            inline,
        })
    }
}
