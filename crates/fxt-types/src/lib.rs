#![forbid(unsafe_code)]
//! Shared vocabulary for the extent engine: keys, item type codes, tree
//! objectids, extent and block-group flags, physical ranges and the
//! little-endian byte helpers used by every on-disk codec.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Superblock placement ────────────────────────────────────────────────────

pub const BTRFS_SUPER_INFO_OFFSET: u64 = 64 * 1024;
pub const BTRFS_SUPER_INFO_SIZE: u64 = 4096;
pub const BTRFS_SUPER_MIRROR_MAX: usize = 3;
pub const BTRFS_SUPER_MIRROR_SHIFT: u32 = 12;

/// Physical byte offset of superblock copy `mirror` on every device.
///
/// Mirror 0 lives at 64 KiB; mirror `i > 0` at `16 KiB << (12 * i)`
/// (64 MiB and 256 GiB).
#[must_use]
pub fn super_mirror_offset(mirror: usize) -> u64 {
    let start = 16 * 1024_u64;
    if mirror == 0 {
        return BTRFS_SUPER_INFO_OFFSET;
    }
    let shift = BTRFS_SUPER_MIRROR_SHIFT * u32::try_from(mirror).unwrap_or(u32::MAX);
    start.checked_shl(shift).unwrap_or(u64::MAX)
}

/// Bytes at the front of every device that are never handed to chunks.
pub const DEVICE_RANGE_RESERVED: u64 = 1024 * 1024;

/// Largest single discard command issued to a device.
pub const MAX_DISCARD_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum tree height.
pub const BTRFS_MAX_LEVEL: u8 = 8;

/// Size of a tree block header; the remainder of the node holds items.
pub const BTRFS_HEADER_SIZE: u32 = 101;
/// Size of one item descriptor in a leaf.
pub const BTRFS_ITEM_SIZE: u32 = 25;

// ── Item type codes ─────────────────────────────────────────────────────────

pub const EXTENT_ITEM_KEY: u8 = 168;
pub const METADATA_ITEM_KEY: u8 = 169;
pub const EXTENT_OWNER_REF_KEY: u8 = 172;
pub const TREE_BLOCK_REF_KEY: u8 = 176;
pub const EXTENT_DATA_REF_KEY: u8 = 178;
pub const SHARED_BLOCK_REF_KEY: u8 = 182;
pub const SHARED_DATA_REF_KEY: u8 = 184;
pub const BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const EXTENT_DATA_KEY: u8 = 108;

// ── Tree objectids ──────────────────────────────────────────────────────────

pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const EXTENT_TREE_OBJECTID: u64 = 2;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const DEV_TREE_OBJECTID: u64 = 4;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const CSUM_TREE_OBJECTID: u64 = 7;
pub const FIRST_FREE_OBJECTID: u64 = 256;
pub const LAST_FREE_OBJECTID: u64 = u64::MAX - 255;
pub const TREE_LOG_OBJECTID: u64 = u64::MAX - 5;
pub const TREE_RELOC_OBJECTID: u64 = u64::MAX - 7;
pub const DATA_RELOC_TREE_OBJECTID: u64 = u64::MAX - 8;

/// Subvolume and snapshot trees whose delayed refs observe tree-mod-log
/// sequencing.
#[must_use]
pub fn is_fstree(root: u64) -> bool {
    root == FS_TREE_OBJECTID || (FIRST_FREE_OBJECTID..=i64::MAX.unsigned_abs()).contains(&root)
}

// ── Extent item flags ───────────────────────────────────────────────────────

pub const EXTENT_FLAG_DATA: u64 = 1;
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;
pub const BLOCK_FLAG_FULL_BACKREF: u64 = 1 << 8;

// ── Block group flags ───────────────────────────────────────────────────────

/// Block group type and profile bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BlockGroupFlags(pub u64);

impl BlockGroupFlags {
    pub const DATA: Self = Self(1);
    pub const SYSTEM: Self = Self(1 << 1);
    pub const METADATA: Self = Self(1 << 2);
    pub const RAID0: Self = Self(1 << 3);
    pub const RAID1: Self = Self(1 << 4);
    pub const DUP: Self = Self(1 << 5);
    pub const RAID10: Self = Self(1 << 6);
    pub const RAID5: Self = Self(1 << 7);
    pub const RAID6: Self = Self(1 << 8);
    pub const RAID1C3: Self = Self(1 << 9);
    pub const RAID1C4: Self = Self(1 << 10);

    pub const TYPE_MASK: u64 = Self::DATA.0 | Self::SYSTEM.0 | Self::METADATA.0;
    pub const PROFILE_MASK: u64 = Self::RAID0.0
        | Self::RAID1.0
        | Self::DUP.0
        | Self::RAID10.0
        | Self::RAID5.0
        | Self::RAID6.0
        | Self::RAID1C3.0
        | Self::RAID1C4.0;

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Type bits only (data, metadata, system).
    #[must_use]
    pub fn type_bits(self) -> Self {
        Self(self.0 & Self::TYPE_MASK)
    }

    #[must_use]
    pub fn is_data(self) -> bool {
        self.contains(Self::DATA)
    }

    #[must_use]
    pub fn is_mixed(self) -> bool {
        self.contains(Self::DATA) && self.contains(Self::METADATA)
    }

    #[must_use]
    pub fn profile(self) -> RaidProfile {
        RaidProfile::from_flags(self)
    }
}

impl fmt::Display for BlockGroupFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (self.is_data(), self.contains(Self::METADATA), self.contains(Self::SYSTEM)) {
            (true, true, _) => "mixed",
            (true, false, _) => "data",
            (false, true, _) => "metadata",
            (false, false, true) => "system",
            (false, false, false) => "none",
        };
        write!(f, "{kind}|{}", self.profile())
    }
}

/// Replication profile of a block group.
///
/// Profiles are visited in `raid_index` order by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidProfile {
    Raid10,
    Raid1,
    Dup,
    Raid0,
    Single,
    Raid5,
    Raid6,
    Raid1C3,
    Raid1C4,
}

impl RaidProfile {
    pub const COUNT: usize = 9;

    pub const BY_INDEX: [Self; Self::COUNT] = [
        Self::Raid10,
        Self::Raid1,
        Self::Dup,
        Self::Raid0,
        Self::Single,
        Self::Raid5,
        Self::Raid6,
        Self::Raid1C3,
        Self::Raid1C4,
    ];

    #[must_use]
    pub fn from_flags(flags: BlockGroupFlags) -> Self {
        let profile = flags.0 & BlockGroupFlags::PROFILE_MASK;
        match profile {
            p if p & BlockGroupFlags::RAID10.0 != 0 => Self::Raid10,
            p if p & BlockGroupFlags::RAID1.0 != 0 => Self::Raid1,
            p if p & BlockGroupFlags::DUP.0 != 0 => Self::Dup,
            p if p & BlockGroupFlags::RAID0.0 != 0 => Self::Raid0,
            p if p & BlockGroupFlags::RAID5.0 != 0 => Self::Raid5,
            p if p & BlockGroupFlags::RAID6.0 != 0 => Self::Raid6,
            p if p & BlockGroupFlags::RAID1C3.0 != 0 => Self::Raid1C3,
            p if p & BlockGroupFlags::RAID1C4.0 != 0 => Self::Raid1C4,
            _ => Self::Single,
        }
    }

    #[must_use]
    pub fn raid_index(self) -> usize {
        match self {
            Self::Raid10 => 0,
            Self::Raid1 => 1,
            Self::Dup => 2,
            Self::Raid0 => 3,
            Self::Single => 4,
            Self::Raid5 => 5,
            Self::Raid6 => 6,
            Self::Raid1C3 => 7,
            Self::Raid1C4 => 8,
        }
    }

    #[must_use]
    pub fn flag(self) -> BlockGroupFlags {
        match self {
            Self::Raid10 => BlockGroupFlags::RAID10,
            Self::Raid1 => BlockGroupFlags::RAID1,
            Self::Dup => BlockGroupFlags::DUP,
            Self::Raid0 => BlockGroupFlags::RAID0,
            Self::Single => BlockGroupFlags(0),
            Self::Raid5 => BlockGroupFlags::RAID5,
            Self::Raid6 => BlockGroupFlags::RAID6,
            Self::Raid1C3 => BlockGroupFlags::RAID1C3,
            Self::Raid1C4 => BlockGroupFlags::RAID1C4,
        }
    }

    /// Number of full copies of every byte, for mirror-style profiles.
    ///
    /// Returns `None` for striped and parity profiles.
    #[must_use]
    pub fn mirror_copies(self) -> Option<usize> {
        match self {
            Self::Single => Some(1),
            Self::Dup | Self::Raid1 => Some(2),
            Self::Raid1C3 => Some(3),
            Self::Raid1C4 => Some(4),
            Self::Raid10 | Self::Raid0 | Self::Raid5 | Self::Raid6 => None,
        }
    }

    /// Whether all copies may live on one device.
    #[must_use]
    pub fn allows_same_device(self) -> bool {
        matches!(self, Self::Single | Self::Dup)
    }
}

impl fmt::Display for RaidProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raid10 => "raid10",
            Self::Raid1 => "raid1",
            Self::Dup => "dup",
            Self::Raid0 => "raid0",
            Self::Single => "single",
            Self::Raid5 => "raid5",
            Self::Raid6 => "raid6",
            Self::Raid1C3 => "raid1c3",
            Self::Raid1C4 => "raid1c4",
        };
        f.write_str(name)
    }
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// Ordered store key: `(objectid, type, offset)`, compared lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl BtrfsKey {
    pub const MIN: Self = Self::new(0, 0, 0);
    pub const MAX: Self = Self::new(u64::MAX, u8::MAX, u64::MAX);

    /// On-disk size of an encoded key.
    pub const DISK_SIZE: usize = 17;

    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Smallest key strictly greater than `self`.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Self { offset, ..self });
        }
        if let Some(item_type) = self.item_type.checked_add(1) {
            return Some(Self::new(self.objectid, item_type, 0));
        }
        self.objectid.checked_add(1).map(|objectid| Self::new(objectid, 0, 0))
    }

    #[must_use]
    pub fn to_disk(self) -> [u8; Self::DISK_SIZE] {
        let mut out = [0_u8; Self::DISK_SIZE];
        out[0..8].copy_from_slice(&self.objectid.to_le_bytes());
        out[8] = self.item_type;
        out[9..17].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn from_disk(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            objectid: read_le_u64(data, offset)?,
            item_type: read_u8(data, offset + 8)?,
            offset: read_le_u64(data, offset + 9)?,
        })
    }
}

impl fmt::Display for BtrfsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

// ── Extent item updates ─────────────────────────────────────────────────────

/// Pending flag or first-key update for an extent item, applied when its
/// delayed-ref head runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentOp {
    pub flags_to_set: u64,
    pub key: Option<BtrfsKey>,
    pub update_flags: bool,
    pub update_key: bool,
}

impl ExtentOp {
    #[must_use]
    pub fn set_flags(flags: u64) -> Self {
        Self {
            flags_to_set: flags,
            update_flags: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn set_key(key: BtrfsKey) -> Self {
        Self {
            key: Some(key),
            update_key: true,
            ..Self::default()
        }
    }

    /// Fold a later op into this one: flags accumulate, the newest key wins.
    pub fn merge(&mut self, later: &Self) {
        if later.update_key {
            self.key = later.key;
            self.update_key = true;
        }
        if later.update_flags {
            self.flags_to_set |= later.flags_to_set;
            self.update_flags = true;
        }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.update_flags && !self.update_key
    }
}

// ── Ranges and counters ─────────────────────────────────────────────────────

/// Physical range on the logical device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysRange {
    pub start: u64,
    pub len: u64,
}

impl PhysRange {
    #[must_use]
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Exclusive end, saturating at `u64::MAX`.
    #[must_use]
    pub fn end(self) -> u64 {
        self.start.saturating_add(self.len)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn contains(self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Overlapping part of two ranges, if any.
    #[must_use]
    pub fn intersect(self, other: Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (start < end).then(|| Self::new(start, end - start))
    }
}

impl fmt::Display for PhysRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, +{})", self.start, self.len)
    }
}

/// Transaction identifier; doubles as the generation stamped on new items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    #[must_use]
    pub fn generation(self) -> Generation {
        Generation(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

/// btrfs device id (`devid`), unique within one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "devid {}", self.0)
    }
}

/// Validated sector size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorSize(u32);

impl SectorSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        u64::from(self.0)
    }

    #[must_use]
    pub fn is_aligned(self, value: u64) -> bool {
        value & (self.get() - 1) == 0
    }

    #[must_use]
    pub fn round_down(self, value: u64) -> u64 {
        value & !(self.get() - 1)
    }

    #[must_use]
    pub fn round_up(self, value: u64) -> Option<u64> {
        align_up(value, self.get())
    }
}

// ── Data back-reference hash ────────────────────────────────────────────────

/// CRC32C without the customary pre/post inversion.
fn crc32c_raw(seed: u32, data: &[u8]) -> u32 {
    !crc32c::crc32c_append(!seed, data)
}

/// Discriminator for `EXTENT_DATA_REF` records.
///
/// Inputs are hashed in their little-endian encoding so the value is the same
/// on every host.
#[must_use]
pub fn hash_extent_data_ref(root: u64, owner: u64, offset: u64) -> u64 {
    let high = crc32c_raw(!0, &root.to_le_bytes());
    let low = crc32c_raw(!0, &owner.to_le_bytes());
    let low = crc32c_raw(low, &offset.to_le_bytes());
    (u64::from(high) << 31) ^ u64::from(low)
}

// ── Parsing helpers ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Overwrite `data[offset..offset + 8]` with `value` in little-endian order.
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    let len = data.len();
    let slot = data
        .get_mut(offset..offset.saturating_add(8))
        .ok_or(ParseError::InsufficientData {
            needed: 8,
            offset,
            actual: len.saturating_sub(offset),
        })?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Overwrite `data[offset..offset + 4]` with `value` in little-endian order.
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let len = data.len();
    let slot = data
        .get_mut(offset..offset.saturating_add(4))
        .ok_or(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual: len.saturating_sub(offset),
        })?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Round `value` up to a multiple of `base` counted from `origin`.
///
/// Unlike [`align_up`], `base` need not be a power of two (full stripe
/// lengths of parity profiles are not).
#[must_use]
pub fn round_up_from(value: u64, origin: u64, base: u64) -> Option<u64> {
    if base == 0 || value < origin {
        return None;
    }
    let rel = value - origin;
    let rounded = rel.checked_add(base - 1)? / base * base;
    origin.checked_add(rounded)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

pub const SZ_4K: u64 = 4 * 1024;
pub const SZ_64K: u64 = 64 * 1024;
pub const SZ_128K: u64 = 128 * 1024;
pub const SZ_1M: u64 = 1024 * 1024;
pub const SZ_2M: u64 = 2 * 1024 * 1024;
pub const SZ_8M: u64 = 8 * 1024 * 1024;
pub const SZ_32M: u64 = 32 * 1024 * 1024;
pub const SZ_256M: u64 = 256 * 1024 * 1024;
pub const SZ_1G: u64 = 1024 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert!(read_le_u64(&bytes, 1).is_err());
    }

    #[test]
    fn test_write_helpers_round_trip_in_place() {
        let mut bytes = [0_u8; 12];
        write_le_u64(&mut bytes, 2, 0x0102_0304_0506_0708).expect("write u64");
        write_le_u32(&mut bytes, 8, 7).expect("write u32");
        assert_eq!(read_le_u64(&bytes, 2).expect("u64"), 0x0102_0304_0506_0708);
        assert_eq!(read_le_u32(&bytes, 8).expect("u32"), 7);
        assert!(write_le_u64(&mut bytes, 8, 1).is_err());
    }

    #[test]
    fn extent_op_merge_accumulates_flags_and_keeps_newest_key() {
        let mut op = ExtentOp::set_flags(BLOCK_FLAG_FULL_BACKREF);
        op.merge(&ExtentOp::set_key(BtrfsKey::new(256, 1, 0)));
        op.merge(&ExtentOp::set_key(BtrfsKey::new(300, 1, 0)));
        op.merge(&ExtentOp::set_flags(EXTENT_FLAG_TREE_BLOCK));
        assert!(op.update_flags && op.update_key);
        assert_eq!(op.flags_to_set, BLOCK_FLAG_FULL_BACKREF | EXTENT_FLAG_TREE_BLOCK);
        assert_eq!(op.key, Some(BtrfsKey::new(300, 1, 0)));
        assert!(ExtentOp::default().is_noop());
    }

    #[test]
    fn test_super_mirror_offsets() {
        assert_eq!(super_mirror_offset(0), 65_536);
        assert_eq!(super_mirror_offset(1), 67_108_864);
        assert_eq!(super_mirror_offset(2), 274_877_906_944);
    }

    #[test]
    fn test_data_ref_hash_is_stable() {
        assert_eq!(hash_extent_data_ref(5, 257, 0), 1_007_496_934_145_758_698);
        assert_eq!(hash_extent_data_ref(5, 300, 4096), 1_007_496_934_110_769_152);
        assert_eq!(hash_extent_data_ref(256, 257, 0), 1_002_667_599_903_692_266);
        assert_ne!(
            hash_extent_data_ref(5, 257, 0),
            hash_extent_data_ref(5, 257, 4096)
        );
    }

    #[test]
    fn test_key_ordering_and_successor() {
        let a = BtrfsKey::new(4096, EXTENT_ITEM_KEY, 8192);
        let b = BtrfsKey::new(4096, TREE_BLOCK_REF_KEY, 0);
        assert!(a < b);
        assert_eq!(
            BtrfsKey::new(1, 2, u64::MAX).successor(),
            Some(BtrfsKey::new(1, 3, 0))
        );
        assert_eq!(BtrfsKey::MAX.successor(), None);
    }

    #[test]
    fn test_key_disk_encoding() {
        let key = BtrfsKey::new(0x1122, METADATA_ITEM_KEY, 3);
        let raw = key.to_disk();
        assert_eq!(BtrfsKey::from_disk(&raw, 0).expect("decode"), key);
    }

    #[test]
    fn test_raid_profile_index_order() {
        for (idx, profile) in RaidProfile::BY_INDEX.iter().enumerate() {
            assert_eq!(profile.raid_index(), idx);
            assert_eq!(RaidProfile::from_flags(profile.flag()), *profile);
        }
        let flags = BlockGroupFlags::DATA.union(BlockGroupFlags::RAID1);
        assert_eq!(flags.profile(), RaidProfile::Raid1);
        assert_eq!(flags.to_string(), "data|raid1");
    }

    #[test]
    fn test_phys_range_math() {
        let r = PhysRange::new(100, 50);
        assert_eq!(r.end(), 150);
        assert!(r.contains(149));
        assert!(!r.contains(150));
        assert_eq!(r.intersect(PhysRange::new(140, 100)), Some(PhysRange::new(140, 10)));
        assert_eq!(r.intersect(PhysRange::new(150, 10)), None);
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_up(1, 3), None);
        assert_eq!(round_up_from(1_000, 100, 300), Some(1_000));
        assert_eq!(round_up_from(1_001, 100, 300), Some(1_300));
        let ss = SectorSize::new(4096).expect("sectorsize");
        assert!(ss.is_aligned(8192));
        assert_eq!(ss.round_down(12_000), 8192);
        assert!(SectorSize::new(3000).is_err());
    }

    #[test]
    fn test_fstree_classification() {
        assert!(is_fstree(FS_TREE_OBJECTID));
        assert!(is_fstree(256));
        assert!(!is_fstree(EXTENT_TREE_OBJECTID));
        assert!(!is_fstree(TREE_LOG_OBJECTID));
        assert!(!is_fstree(DATA_RELOC_TREE_OBJECTID));
    }
}
