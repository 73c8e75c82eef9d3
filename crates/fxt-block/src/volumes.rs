//! Logical chunk → device stripe mapping.
//!
//! Every block group is backed by one chunk: a logical range mapped onto one
//! or more device stripes. Only mirror-style profiles (single, dup, raid1,
//! raid1c3, raid1c4) are mapped here; each stripe carries a full copy of the
//! chunk, so mapping a logical range is a per-stripe offset shift.

use crate::{BlockDevice, issue_discard};
use asupersync::Cx;
use fxt_error::{FxtError, Result};
use fxt_types::{BlockGroupFlags, DEVICE_RANGE_RESERVED, DeviceId, PhysRange, RaidProfile, SZ_1M};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: DeviceId,
    pub physical: u64,
}

/// A logical address range and the device stripes holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub logical: u64,
    pub length: u64,
    pub flags: BlockGroupFlags,
    pub stripes: Vec<Stripe>,
}

impl Chunk {
    #[must_use]
    pub fn range(&self) -> PhysRange {
        PhysRange::new(self.logical, self.length)
    }

    /// Physical pieces backing `[logical, logical + len)`, one per stripe.
    pub fn map(&self, logical: u64, len: u64) -> Result<Vec<(DeviceId, u64, u64)>> {
        let want = PhysRange::new(logical, len);
        let Some(hit) = self.range().intersect(want) else {
            return Err(FxtError::InvalidArgument(format!(
                "range {want} outside chunk {}",
                self.range()
            )));
        };
        let offset = hit.start - self.logical;
        Ok(self
            .stripes
            .iter()
            .map(|stripe| (stripe.devid, stripe.physical + offset, hit.len))
            .collect())
    }
}

struct DeviceEntry {
    dev: Arc<dyn BlockDevice>,
    /// Allocated device extents: physical start → length.
    dev_extents: BTreeMap<u64, u64>,
    missing: bool,
}

impl fmt::Debug for DeviceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEntry")
            .field("devid", &self.dev.devid())
            .field("dev_extents", &self.dev_extents.len())
            .field("missing", &self.missing)
            .finish()
    }
}

impl DeviceEntry {
    /// Unallocated holes at or after the reserved first megabyte.
    fn holes(&self) -> Vec<PhysRange> {
        let total = self.dev.total_bytes();
        let mut holes = Vec::new();
        let mut cursor = DEVICE_RANGE_RESERVED;
        for (&start, &len) in &self.dev_extents {
            if start > cursor {
                holes.push(PhysRange::new(cursor, start - cursor));
            }
            cursor = cursor.max(start.saturating_add(len));
        }
        if cursor < total {
            holes.push(PhysRange::new(cursor, total - cursor));
        }
        holes
    }

    fn largest_hole(&self) -> Option<PhysRange> {
        self.holes().into_iter().max_by_key(|hole| (hole.len, std::cmp::Reverse(hole.start)))
    }

    fn usable(&self) -> bool {
        !self.missing && self.dev.is_writable()
    }
}

#[derive(Debug, Default)]
struct VolumesInner {
    devices: BTreeMap<DeviceId, DeviceEntry>,
    chunks: BTreeMap<u64, Chunk>,
    next_logical: u64,
}

/// Device set and chunk map of one filesystem.
#[derive(Debug)]
pub struct Volumes {
    inner: RwLock<VolumesInner>,
}

impl Volumes {
    /// Empty device set. New chunks are placed at or after `first_logical`.
    #[must_use]
    pub fn new(first_logical: u64) -> Self {
        Self {
            inner: RwLock::new(VolumesInner {
                next_logical: first_logical,
                ..VolumesInner::default()
            }),
        }
    }

    pub fn add_device(&self, dev: Arc<dyn BlockDevice>) -> Result<()> {
        let mut inner = self.inner.write();
        let devid = dev.devid();
        if inner.devices.contains_key(&devid) {
            return Err(FxtError::Exists(format!("{devid}")));
        }
        inner.devices.insert(
            devid,
            DeviceEntry {
                dev,
                dev_extents: BTreeMap::new(),
                missing: false,
            },
        );
        Ok(())
    }

    pub fn mark_missing(&self, devid: DeviceId) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .devices
            .get_mut(&devid)
            .ok_or_else(|| FxtError::NotFound(format!("{devid}")))?;
        entry.missing = true;
        Ok(())
    }

    #[must_use]
    pub fn device(&self, devid: DeviceId) -> Option<Arc<dyn BlockDevice>> {
        self.inner.read().devices.get(&devid).map(|e| Arc::clone(&e.dev))
    }

    #[must_use]
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.inner.read().devices.keys().copied().collect()
    }

    #[must_use]
    pub fn chunk_for(&self, logical: u64) -> Option<Chunk> {
        let inner = self.inner.read();
        inner
            .chunks
            .range(..=logical)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.range().contains(logical))
            .cloned()
    }

    #[must_use]
    pub fn chunks(&self) -> Vec<Chunk> {
        self.inner.read().chunks.values().cloned().collect()
    }

    /// Total unallocated bytes over every usable device.
    #[must_use]
    pub fn unallocated_bytes(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .devices
            .values()
            .filter(|e| e.usable())
            .flat_map(DeviceEntry::holes)
            .map(|h| h.len)
            .sum()
    }

    /// Register a chunk whose stripes were chosen by the caller.
    pub fn insert_chunk(&self, chunk: Chunk) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.chunks.values().any(|c| c.range().overlaps(chunk.range())) {
            return Err(FxtError::Exists(format!("chunk overlapping {}", chunk.range())));
        }
        for stripe in &chunk.stripes {
            let entry = inner
                .devices
                .get_mut(&stripe.devid)
                .ok_or_else(|| FxtError::NotFound(format!("{}", stripe.devid)))?;
            let want = PhysRange::new(stripe.physical, chunk.length);
            if want.end() > entry.dev.total_bytes()
                || entry
                    .dev_extents
                    .iter()
                    .any(|(&s, &l)| PhysRange::new(s, l).overlaps(want))
            {
                return Err(FxtError::InvalidArgument(format!(
                    "stripe {want} on {} is not free",
                    stripe.devid
                )));
            }
            entry.dev_extents.insert(stripe.physical, chunk.length);
        }
        inner.next_logical = inner.next_logical.max(chunk.range().end());
        inner.chunks.insert(chunk.logical, chunk);
        Ok(())
    }

    /// Carve a new chunk of at most `max_size` bytes for `flags`.
    ///
    /// Fails with `NoSpace` when the devices cannot hold at least one
    /// megabyte per stripe.
    pub fn alloc_chunk(&self, flags: BlockGroupFlags, max_size: u64) -> Result<Chunk> {
        let profile = flags.profile();
        let copies = profile.mirror_copies().ok_or_else(|| {
            FxtError::UnsupportedFeature(format!("chunk allocation for profile {profile}"))
        })?;

        let mut inner = self.inner.write();
        let mut candidates: Vec<(DeviceId, PhysRange)> = inner
            .devices
            .iter()
            .filter(|(_, e)| e.usable())
            .filter_map(|(id, e)| e.largest_hole().map(|h| (*id, h)))
            .collect();
        candidates.sort_by(|a, b| b.1.len.cmp(&a.1.len).then(a.0.cmp(&b.0)));

        let stripes_per_device = if profile == RaidProfile::Dup { 2 } else { 1 };
        let devices_needed = copies / stripes_per_device;
        if candidates.len() < devices_needed {
            return Err(FxtError::NoSpace { max_extent_size: 0 });
        }
        let chosen = &candidates[..devices_needed];
        let per_stripe_room = chosen
            .iter()
            .map(|(_, hole)| hole.len / stripes_per_device as u64)
            .min()
            .unwrap_or(0);
        let stripe_len = max_size.min(per_stripe_room) & !(SZ_1M - 1);
        if stripe_len < SZ_1M {
            debug!(%flags, per_stripe_room, "no device room for a new chunk");
            return Err(FxtError::NoSpace { max_extent_size: 0 });
        }

        let mut stripes = Vec::with_capacity(copies);
        for (devid, hole) in chosen {
            for n in 0..stripes_per_device as u64 {
                stripes.push(Stripe {
                    devid: *devid,
                    physical: hole.start + n * stripe_len,
                });
            }
        }
        for stripe in &stripes {
            if let Some(entry) = inner.devices.get_mut(&stripe.devid) {
                entry.dev_extents.insert(stripe.physical, stripe_len);
            }
        }

        let logical = inner.next_logical;
        inner.next_logical = logical.saturating_add(stripe_len);
        let chunk = Chunk {
            logical,
            length: stripe_len,
            flags,
            stripes,
        };
        inner.chunks.insert(logical, chunk.clone());
        info!(logical, length = stripe_len, %flags, "allocated chunk");
        Ok(chunk)
    }

    /// Remove a chunk and release its device extents.
    pub fn remove_chunk(&self, logical: u64) -> Result<Chunk> {
        let mut inner = self.inner.write();
        let chunk = inner
            .chunks
            .remove(&logical)
            .ok_or_else(|| FxtError::NotFound(format!("chunk at {logical}")))?;
        for stripe in &chunk.stripes {
            if let Some(entry) = inner.devices.get_mut(&stripe.devid) {
                entry.dev_extents.remove(&stripe.physical);
            }
        }
        Ok(chunk)
    }

    fn stripes_for(&self, logical: u64, len: u64) -> Result<Vec<(Arc<dyn BlockDevice>, bool, u64, u64)>> {
        let chunk = self
            .chunk_for(logical)
            .ok_or_else(|| FxtError::NotFound(format!("no chunk maps logical {logical}")))?;
        let pieces = chunk.map(logical, len)?;
        let inner = self.inner.read();
        Ok(pieces
            .into_iter()
            .filter_map(|(devid, physical, plen)| {
                inner
                    .devices
                    .get(&devid)
                    .map(|e| (Arc::clone(&e.dev), e.missing, physical, plen))
            })
            .collect())
    }

    /// Discard a logical range on every stripe that backs it.
    ///
    /// Read-only, missing and non-discarding devices are skipped. Returns the
    /// logical bytes covered by successful discards on at least one stripe.
    pub fn discard_logical(&self, cx: &Cx, logical: u64, len: u64, max_chunk: u64) -> Result<u64> {
        let mut total = 0_u64;
        let mut cursor = logical;
        let end = logical.saturating_add(len);
        while cursor < end {
            let chunk = self
                .chunk_for(cursor)
                .ok_or_else(|| FxtError::NotFound(format!("no chunk maps logical {cursor}")))?;
            let step = (chunk.range().end() - cursor).min(end - cursor);
            let mut best = 0_u64;
            for (dev, missing, physical, plen) in self.stripes_for(cursor, step)? {
                if missing || !dev.is_writable() || dev.max_discard_sectors() == 0 {
                    continue;
                }
                let done = issue_discard(cx, dev.as_ref(), physical, plen, max_chunk)?;
                best = best.max(done);
            }
            total += best;
            cursor += step;
        }
        Ok(total)
    }

    /// Reset the device zones backing a logical range.
    pub fn zone_reset_logical(&self, cx: &Cx, logical: u64, len: u64) -> Result<()> {
        for (dev, missing, physical, plen) in self.stripes_for(logical, len)? {
            if missing {
                continue;
            }
            dev.zone_reset(cx, physical, plen)?;
        }
        Ok(())
    }

    /// Discard every unallocated hole of at least `min_len` bytes on one
    /// device. Returns the bytes discarded.
    pub fn trim_free_extents(
        &self,
        cx: &Cx,
        devid: DeviceId,
        min_len: u64,
        max_chunk: u64,
    ) -> Result<u64> {
        let (dev, holes) = {
            let inner = self.inner.read();
            let entry = inner
                .devices
                .get(&devid)
                .ok_or_else(|| FxtError::NotFound(format!("{devid}")))?;
            if !entry.usable() || entry.dev.max_discard_sectors() == 0 {
                return Ok(0);
            }
            (Arc::clone(&entry.dev), entry.holes())
        };
        let mut trimmed = 0_u64;
        for hole in holes.into_iter().filter(|h| h.len >= min_len.max(1)) {
            match issue_discard(cx, dev.as_ref(), hole.start, hole.len, max_chunk) {
                Ok(done) => trimmed += done,
                Err(err) => {
                    warn!(devid = devid.0, start = hole.start, len = hole.len, error = %err, "trim of unallocated space failed");
                    return Err(err);
                }
            }
        }
        Ok(trimmed)
    }

    /// Whether `devid` is present and not marked missing.
    #[must_use]
    pub fn is_present(&self, devid: DeviceId) -> bool {
        self.inner
            .read()
            .devices
            .get(&devid)
            .is_some_and(|e| !e.missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceCommand, MemBlockDevice};
    use fxt_types::{SZ_1G, SZ_256M};

    fn volumes_with(devs: &[Arc<MemBlockDevice>]) -> Volumes {
        let vols = Volumes::new(SZ_1M * 16);
        for dev in devs {
            vols.add_device(Arc::clone(dev) as Arc<dyn BlockDevice>).expect("add device");
        }
        vols
    }

    #[test]
    fn single_chunk_skips_reserved_megabyte() {
        let dev = Arc::new(MemBlockDevice::new(1, SZ_1G));
        let vols = volumes_with(&[Arc::clone(&dev)]);
        let chunk = vols
            .alloc_chunk(BlockGroupFlags::DATA, SZ_256M)
            .expect("chunk");
        assert_eq!(chunk.logical, SZ_1M * 16);
        assert_eq!(chunk.length, SZ_256M);
        assert_eq!(chunk.stripes, vec![Stripe { devid: DeviceId(1), physical: SZ_1M }]);
        assert_eq!(vols.chunk_for(chunk.logical + 5), Some(chunk.clone()));
        assert_eq!(vols.chunk_for(chunk.logical + chunk.length), None);
    }

    #[test]
    fn dup_places_two_stripes_on_one_device() {
        let dev = Arc::new(MemBlockDevice::new(1, SZ_1G));
        let vols = volumes_with(&[dev]);
        let flags = BlockGroupFlags::METADATA.union(BlockGroupFlags::DUP);
        let chunk = vols.alloc_chunk(flags, SZ_256M).expect("chunk");
        assert_eq!(chunk.stripes.len(), 2);
        assert_eq!(chunk.stripes[1].physical - chunk.stripes[0].physical, SZ_256M);
    }

    #[test]
    fn raid1_needs_two_devices() {
        let a = Arc::new(MemBlockDevice::new(1, SZ_1G));
        let flags = BlockGroupFlags::DATA.union(BlockGroupFlags::RAID1);
        let vols = volumes_with(&[Arc::clone(&a)]);
        assert!(matches!(
            vols.alloc_chunk(flags, SZ_256M),
            Err(FxtError::NoSpace { .. })
        ));
        let b = Arc::new(MemBlockDevice::new(2, SZ_1G));
        vols.add_device(b as Arc<dyn BlockDevice>).expect("add");
        let chunk = vols.alloc_chunk(flags, SZ_256M).expect("chunk");
        let devids: Vec<_> = chunk.stripes.iter().map(|s| s.devid.0).collect();
        assert_eq!(devids, vec![1, 2]);
    }

    #[test]
    fn chunk_size_is_capped_by_device_room() {
        let dev = Arc::new(MemBlockDevice::new(1, 64 * SZ_1M));
        let vols = volumes_with(&[dev]);
        let chunk = vols.alloc_chunk(BlockGroupFlags::DATA, SZ_1G).expect("chunk");
        assert_eq!(chunk.length, 63 * SZ_1M);
        assert!(vols.alloc_chunk(BlockGroupFlags::DATA, SZ_1G).is_err());
    }

    #[test]
    fn striped_profiles_are_rejected() {
        let dev = Arc::new(MemBlockDevice::new(1, SZ_1G));
        let vols = volumes_with(&[dev]);
        let flags = BlockGroupFlags::DATA.union(BlockGroupFlags::RAID0);
        assert!(matches!(
            vols.alloc_chunk(flags, SZ_256M),
            Err(FxtError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn discard_logical_hits_every_mirror() {
        let a = Arc::new(MemBlockDevice::new(1, SZ_1G));
        let b = Arc::new(MemBlockDevice::new(2, SZ_1G));
        let vols = volumes_with(&[Arc::clone(&a), Arc::clone(&b)]);
        let flags = BlockGroupFlags::DATA.union(BlockGroupFlags::RAID1);
        let chunk = vols.alloc_chunk(flags, SZ_256M).expect("chunk");
        let done = vols
            .discard_logical(&Cx::for_testing(), chunk.logical + 8192, 4096, 0)
            .expect("discard");
        assert_eq!(done, 4096);
        assert_eq!(
            a.commands(),
            vec![DeviceCommand::Discard { start: SZ_1M + 8192, len: 4096 }]
        );
        assert_eq!(b.commands().len(), 1);
    }

    #[test]
    fn discard_skips_read_only_devices() {
        let dev = Arc::new(MemBlockDevice::new(1, SZ_1G).read_only());
        let vols = Volumes::new(0);
        vols.add_device(Arc::clone(&dev) as Arc<dyn BlockDevice>).expect("add");
        vols.insert_chunk(Chunk {
            logical: 0,
            length: SZ_256M,
            flags: BlockGroupFlags::DATA,
            stripes: vec![Stripe { devid: DeviceId(1), physical: SZ_1M }],
        })
        .expect("insert");
        assert_eq!(vols.discard_logical(&Cx::for_testing(), 0, 4096, 0).expect("discard"), 0);
        assert!(dev.commands().is_empty());
    }

    #[test]
    fn trim_covers_only_unallocated_space() {
        let dev = Arc::new(MemBlockDevice::new(1, 512 * SZ_1M));
        let vols = volumes_with(&[Arc::clone(&dev)]);
        vols.alloc_chunk(BlockGroupFlags::DATA, SZ_256M).expect("chunk");
        let trimmed = vols.trim_free_extents(&Cx::for_testing(), DeviceId(1), 0, 0).expect("trim");
        assert_eq!(trimmed, 512 * SZ_1M - SZ_1M - SZ_256M);
        assert_eq!(
            dev.commands(),
            vec![DeviceCommand::Discard {
                start: SZ_1M + SZ_256M,
                len: 512 * SZ_1M - SZ_1M - SZ_256M
            }]
        );
    }

    #[test]
    fn remove_chunk_frees_device_extents() {
        let dev = Arc::new(MemBlockDevice::new(1, 64 * SZ_1M));
        let vols = volumes_with(&[dev]);
        let chunk = vols.alloc_chunk(BlockGroupFlags::DATA, SZ_1G).expect("chunk");
        assert_eq!(vols.unallocated_bytes(), 0);
        vols.remove_chunk(chunk.logical).expect("remove");
        assert_eq!(vols.unallocated_bytes(), 63 * SZ_1M);
    }
}
