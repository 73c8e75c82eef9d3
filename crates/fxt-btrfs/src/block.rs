//! Tree blocks: header, key pointers and leaf items.
//!
//! Layout of an encoded block of `nodesize` bytes:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 32 | checksum (crc32c of bytes `0x20..`, first 4 bytes used) |
//! | 0x30 | 8 | bytenr |
//! | 0x38 | 8 | flags |
//! | 0x50 | 8 | generation |
//! | 0x58 | 8 | owner |
//! | 0x60 | 4 | nritems |
//! | 0x64 | 1 | level |
//!
//! Internal nodes follow the header with 33-byte key pointers. Leaves
//! follow it with 25-byte item headers whose payload offsets are relative
//! to the end of the header; payloads are packed from the end of the block.

use fxt_error::{FxtError, Result};
use fxt_types::{
    BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BTRFS_MAX_LEVEL, BtrfsKey, ParseError, ensure_slice,
    read_le_u32, read_le_u64, read_u8, write_le_u32, write_le_u64,
};

/// Set once the block has reached disk; a freed written block must be pinned.
pub const HEADER_FLAG_WRITTEN: u64 = 1 << 0;

pub const KEY_PTR_SIZE: usize = 33;

const CSUM_SIZE: usize = 32;
const OFF_BYTENR: usize = 0x30;
const OFF_FLAGS: usize = 0x38;
const OFF_GENERATION: usize = 0x50;
const OFF_OWNER: usize = 0x58;
const OFF_NRITEMS: usize = 0x60;
const OFF_LEVEL: usize = 0x64;
const HEADER: usize = BTRFS_HEADER_SIZE as usize;
const ITEM: usize = BTRFS_ITEM_SIZE as usize;

/// Pointer from an internal node to a child block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePtr {
    pub key: BtrfsKey,
    pub blockptr: u64,
    pub generation: u64,
}

/// One leaf item and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafItem {
    pub key: BtrfsKey,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockBody {
    Node(Vec<NodePtr>),
    Leaf(Vec<LeafItem>),
}

/// What a reader expects of the block a parent points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCheck {
    pub level: u8,
    pub generation: u64,
    pub first_key: Option<BtrfsKey>,
}

/// A decoded tree block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBlock {
    pub bytenr: u64,
    pub generation: u64,
    pub owner: u64,
    pub flags: u64,
    pub level: u8,
    pub body: BlockBody,
}

impl TreeBlock {
    #[must_use]
    pub fn leaf(bytenr: u64, generation: u64, owner: u64, items: Vec<LeafItem>) -> Self {
        Self {
            bytenr,
            generation,
            owner,
            flags: 0,
            level: 0,
            body: BlockBody::Leaf(items),
        }
    }

    #[must_use]
    pub fn node(bytenr: u64, generation: u64, owner: u64, level: u8, ptrs: Vec<NodePtr>) -> Self {
        Self {
            bytenr,
            generation,
            owner,
            flags: 0,
            level,
            body: BlockBody::Node(ptrs),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self.body, BlockBody::Leaf(_))
    }

    #[must_use]
    pub fn is_written(&self) -> bool {
        self.flags & HEADER_FLAG_WRITTEN != 0
    }

    #[must_use]
    pub fn nritems(&self) -> usize {
        match &self.body {
            BlockBody::Node(ptrs) => ptrs.len(),
            BlockBody::Leaf(items) => items.len(),
        }
    }

    #[must_use]
    pub fn key_at(&self, slot: usize) -> Option<BtrfsKey> {
        match &self.body {
            BlockBody::Node(ptrs) => ptrs.get(slot).map(|ptr| ptr.key),
            BlockBody::Leaf(items) => items.get(slot).map(|item| item.key),
        }
    }

    #[must_use]
    pub fn first_key(&self) -> Option<BtrfsKey> {
        self.key_at(0)
    }

    #[must_use]
    pub fn ptr(&self, slot: usize) -> Option<&NodePtr> {
        match &self.body {
            BlockBody::Node(ptrs) => ptrs.get(slot),
            BlockBody::Leaf(_) => None,
        }
    }

    #[must_use]
    pub fn ptrs(&self) -> &[NodePtr] {
        match &self.body {
            BlockBody::Node(ptrs) => ptrs,
            BlockBody::Leaf(_) => &[],
        }
    }

    #[must_use]
    pub fn items(&self) -> &[LeafItem] {
        match &self.body {
            BlockBody::Node(_) => &[],
            BlockBody::Leaf(items) => items,
        }
    }

    /// Slot a search for `key` lands on: the last slot whose key is `<= key`.
    #[must_use]
    pub fn search_slot(&self, key: &BtrfsKey) -> (usize, bool) {
        let keys: Vec<BtrfsKey> = (0..self.nritems()).filter_map(|s| self.key_at(s)).collect();
        match keys.binary_search(key) {
            Ok(slot) => (slot, true),
            Err(0) => (0, false),
            Err(slot) => (slot - 1, false),
        }
    }

    // ── Codec ───────────────────────────────────────────────────────────────

    pub fn encode(&self, nodesize: usize) -> std::result::Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; nodesize];
        if nodesize <= HEADER || self.level >= BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "block geometry out of range",
            });
        }
        let nritems = u32::try_from(self.nritems())
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
        write_le_u64(&mut block, OFF_BYTENR, self.bytenr)?;
        write_le_u64(&mut block, OFF_FLAGS, self.flags)?;
        write_le_u64(&mut block, OFF_GENERATION, self.generation)?;
        write_le_u64(&mut block, OFF_OWNER, self.owner)?;
        write_le_u32(&mut block, OFF_NRITEMS, nritems)?;
        block[OFF_LEVEL] = self.level;

        match &self.body {
            BlockBody::Node(ptrs) => {
                if HEADER + ptrs.len() * KEY_PTR_SIZE > nodesize {
                    return Err(ParseError::InvalidField {
                        field: "nritems",
                        reason: "key pointers overflow the block",
                    });
                }
                for (slot, ptr) in ptrs.iter().enumerate() {
                    let base = HEADER + slot * KEY_PTR_SIZE;
                    block[base..base + BtrfsKey::DISK_SIZE].copy_from_slice(&ptr.key.to_disk());
                    write_le_u64(&mut block, base + 17, ptr.blockptr)?;
                    write_le_u64(&mut block, base + 25, ptr.generation)?;
                }
            }
            BlockBody::Leaf(items) => {
                let mut data_end = nodesize - HEADER;
                for (slot, item) in items.iter().enumerate() {
                    let base = HEADER + slot * ITEM;
                    let Some(data_start) = data_end.checked_sub(item.data.len()) else {
                        return Err(ParseError::InvalidField {
                            field: "data_size",
                            reason: "leaf items overflow the block",
                        });
                    };
                    if HEADER + (slot + 1) * ITEM > HEADER + data_start {
                        return Err(ParseError::InvalidField {
                            field: "data_size",
                            reason: "leaf items overflow the block",
                        });
                    }
                    block[base..base + BtrfsKey::DISK_SIZE].copy_from_slice(&item.key.to_disk());
                    let offset = u32::try_from(data_start)
                        .map_err(|_| ParseError::IntegerConversion { field: "data_offset" })?;
                    let size = u32::try_from(item.data.len())
                        .map_err(|_| ParseError::IntegerConversion { field: "data_size" })?;
                    write_le_u32(&mut block, base + 17, offset)?;
                    write_le_u32(&mut block, base + 21, size)?;
                    block[HEADER + data_start..HEADER + data_end].copy_from_slice(&item.data);
                    data_end = data_start;
                }
            }
        }
        let csum = crc32c::crc32c(&block[CSUM_SIZE..]);
        block[..4].copy_from_slice(&csum.to_le_bytes());
        Ok(block)
    }

    pub fn parse(block: &[u8]) -> std::result::Result<Self, ParseError> {
        ensure_slice(block, 0, HEADER)?;
        let stored = read_le_u32(block, 0)?;
        if stored != crc32c::crc32c(&block[CSUM_SIZE..]) {
            return Err(ParseError::InvalidField {
                field: "csum",
                reason: "checksum mismatch",
            });
        }
        let bytenr = read_le_u64(block, OFF_BYTENR)?;
        let flags = read_le_u64(block, OFF_FLAGS)?;
        let generation = read_le_u64(block, OFF_GENERATION)?;
        let owner = read_le_u64(block, OFF_OWNER)?;
        let nritems = usize::try_from(read_le_u32(block, OFF_NRITEMS)?)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
        let level = read_u8(block, OFF_LEVEL)?;
        if level >= BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree height",
            });
        }

        let body = if level > 0 {
            if nritems > (block.len() - HEADER) / KEY_PTR_SIZE {
                return Err(ParseError::InvalidField {
                    field: "nritems",
                    reason: "exceeds node capacity",
                });
            }
            let mut ptrs = Vec::with_capacity(nritems);
            for slot in 0..nritems {
                let base = HEADER + slot * KEY_PTR_SIZE;
                ptrs.push(NodePtr {
                    key: BtrfsKey::from_disk(block, base)?,
                    blockptr: read_le_u64(block, base + 17)?,
                    generation: read_le_u64(block, base + 25)?,
                });
            }
            BlockBody::Node(ptrs)
        } else {
            if nritems > (block.len() - HEADER) / ITEM {
                return Err(ParseError::InvalidField {
                    field: "nritems",
                    reason: "exceeds leaf capacity",
                });
            }
            let mut items = Vec::with_capacity(nritems);
            for slot in 0..nritems {
                let base = HEADER + slot * ITEM;
                let offset = usize::try_from(read_le_u32(block, base + 17)?)
                    .map_err(|_| ParseError::IntegerConversion { field: "data_offset" })?;
                let size = usize::try_from(read_le_u32(block, base + 21)?)
                    .map_err(|_| ParseError::IntegerConversion { field: "data_size" })?;
                let data = ensure_slice(block, HEADER + offset, size).map_err(|_| {
                    ParseError::InvalidField {
                        field: "data_offset",
                        reason: "item data extends past block",
                    }
                })?;
                items.push(LeafItem {
                    key: BtrfsKey::from_disk(block, base)?,
                    data: data.to_vec(),
                });
            }
            BlockBody::Leaf(items)
        };

        let parsed = Self {
            bytenr,
            generation,
            owner,
            flags,
            level,
            body,
        };
        let in_order = (1..parsed.nritems()).all(|slot| parsed.key_at(slot - 1) < parsed.key_at(slot));
        if !in_order {
            return Err(ParseError::InvalidField {
                field: "key",
                reason: "keys out of order",
            });
        }
        Ok(parsed)
    }

    /// Check a freshly read block against what its parent promised.
    pub fn verify(&self, bytenr: u64, check: &BlockCheck) -> Result<()> {
        if self.bytenr != bytenr {
            return Err(FxtError::corruption(
                bytenr,
                format!("block header claims bytenr {}", self.bytenr),
            ));
        }
        if self.level != check.level {
            return Err(FxtError::corruption(
                bytenr,
                format!("mismatched level: have {} expect {}", self.level, check.level),
            ));
        }
        if self.generation != check.generation {
            return Err(FxtError::corruption(
                bytenr,
                format!(
                    "parent transid verify failed: have {} expect {}",
                    self.generation, check.generation
                ),
            ));
        }
        if let Some(expected) = check.first_key {
            if self.first_key() != Some(expected) {
                return Err(FxtError::corruption(bytenr, "first key does not match parent"));
            }
        }
        Ok(())
    }
}

// ── File extents ────────────────────────────────────────────────────────────

pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;
pub const FILE_EXTENT_ITEM_SIZE: usize = 53;
const FILE_EXTENT_INLINE_DATA_START: usize = 21;

/// Payload of an `EXTENT_DATA` leaf item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub kind: u8,
    /// Zero for a hole.
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    /// Offset into the extent where this file range starts.
    pub offset: u64,
    pub num_bytes: u64,
}

impl FileExtent {
    #[must_use]
    pub fn regular(generation: u64, disk_bytenr: u64, disk_num_bytes: u64, offset: u64) -> Self {
        Self {
            generation,
            ram_bytes: disk_num_bytes,
            compression: 0,
            kind: FILE_EXTENT_REG,
            disk_bytenr,
            disk_num_bytes,
            offset,
            num_bytes: disk_num_bytes.saturating_sub(offset),
        }
    }

    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.kind == FILE_EXTENT_INLINE
    }

    /// Whether the item holds a reference on an on-disk extent.
    #[must_use]
    pub fn references_extent(&self) -> bool {
        !self.is_inline() && self.disk_bytenr != 0
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILE_EXTENT_ITEM_SIZE);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.ram_bytes.to_le_bytes());
        out.push(self.compression);
        out.push(0);
        out.extend_from_slice(&0_u16.to_le_bytes());
        out.push(self.kind);
        out.extend_from_slice(&self.disk_bytenr.to_le_bytes());
        out.extend_from_slice(&self.disk_num_bytes.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.num_bytes.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> std::result::Result<Self, ParseError> {
        ensure_slice(data, 0, FILE_EXTENT_INLINE_DATA_START)?;
        let kind = read_u8(data, 20)?;
        let mut extent = Self {
            generation: read_le_u64(data, 0)?,
            ram_bytes: read_le_u64(data, 8)?,
            compression: read_u8(data, 16)?,
            kind,
            disk_bytenr: 0,
            disk_num_bytes: 0,
            offset: 0,
            num_bytes: 0,
        };
        match kind {
            FILE_EXTENT_INLINE => {}
            FILE_EXTENT_REG | FILE_EXTENT_PREALLOC => {
                extent.disk_bytenr = read_le_u64(data, 21)?;
                extent.disk_num_bytes = read_le_u64(data, 29)?;
                extent.offset = read_le_u64(data, 37)?;
                extent.num_bytes = read_le_u64(data, 45)?;
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "file_extent_type",
                    reason: "unknown file extent type",
                });
            }
        }
        Ok(extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxt_types::EXTENT_DATA_KEY;

    const NODESIZE: usize = 4096;

    fn file_leaf() -> TreeBlock {
        let items = (0..3_u64)
            .map(|i| LeafItem {
                key: BtrfsKey::new(257, EXTENT_DATA_KEY, i * 4096),
                data: FileExtent::regular(7, (1 << 20) + i * 4096, 4096, 0).encode(),
            })
            .collect();
        TreeBlock::leaf(1 << 30, 7, 5, items)
    }

    #[test]
    fn leaf_survives_the_codec() {
        let leaf = file_leaf();
        let bytes = leaf.encode(NODESIZE).expect("encode");
        assert_eq!(bytes.len(), NODESIZE);
        assert_eq!(TreeBlock::parse(&bytes).expect("parse"), leaf);
    }

    #[test]
    fn node_survives_the_codec() {
        let ptrs = vec![
            NodePtr {
                key: BtrfsKey::new(256, 1, 0),
                blockptr: 1 << 30,
                generation: 7,
            },
            NodePtr {
                key: BtrfsKey::new(300, 1, 0),
                blockptr: (1 << 30) + 4096,
                generation: 8,
            },
        ];
        let node = TreeBlock::node(2 << 30, 8, 5, 1, ptrs);
        let bytes = node.encode(NODESIZE).expect("encode");
        assert_eq!(TreeBlock::parse(&bytes).expect("parse"), node);
    }

    #[test]
    fn flipped_byte_fails_the_checksum() {
        let mut bytes = file_leaf().encode(NODESIZE).expect("encode");
        bytes[NODESIZE - 1] ^= 0xff;
        assert!(matches!(
            TreeBlock::parse(&bytes),
            Err(ParseError::InvalidField { field: "csum", .. })
        ));
    }

    #[test]
    fn oversized_leaf_is_rejected() {
        let items = (0..2_u64)
            .map(|i| LeafItem {
                key: BtrfsKey::new(257, 1, i),
                data: vec![0; NODESIZE],
            })
            .collect();
        let leaf = TreeBlock::leaf(1 << 30, 1, 5, items);
        assert!(leaf.encode(NODESIZE).is_err());
    }

    #[test]
    fn verify_reports_parent_mismatches() {
        let leaf = file_leaf();
        let good = BlockCheck {
            level: 0,
            generation: 7,
            first_key: leaf.first_key(),
        };
        leaf.verify(1 << 30, &good).expect("matches");
        let stale = BlockCheck {
            generation: 6,
            ..good
        };
        assert!(matches!(
            leaf.verify(1 << 30, &stale),
            Err(FxtError::Corruption { block, .. }) if block == 1 << 30
        ));
        let wrong_level = BlockCheck { level: 1, ..good };
        assert!(leaf.verify(1 << 30, &wrong_level).is_err());
    }

    #[test]
    fn search_slot_lands_on_the_covering_pointer() {
        let ptrs = [0_u64, 100, 200]
            .iter()
            .map(|&objectid| NodePtr {
                key: BtrfsKey::new(objectid, 1, 0),
                blockptr: 1 << 20,
                generation: 1,
            })
            .collect();
        let node = TreeBlock::node(1 << 30, 1, 5, 1, ptrs);
        assert_eq!(node.search_slot(&BtrfsKey::new(100, 1, 0)), (1, true));
        assert_eq!(node.search_slot(&BtrfsKey::new(150, 1, 0)), (1, false));
        assert_eq!(node.search_slot(&BtrfsKey::new(500, 1, 0)), (2, false));
    }

    #[test]
    fn holes_and_inline_extents_hold_no_reference() {
        let hole = FileExtent::regular(1, 0, 0, 0);
        assert!(!hole.references_extent());
        let mut inline = FileExtent::parse(&FileExtent::regular(1, 4096, 4096, 0).encode())
            .expect("parse");
        assert!(inline.references_extent());
        inline.kind = FILE_EXTENT_INLINE;
        let parsed = FileExtent::parse(&inline.encode()[..21]).expect("inline header only");
        assert!(!parsed.references_extent());
    }
}
