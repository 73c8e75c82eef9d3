//! Mount options and device layout.

use fxt_alloc::AllocConfig;
use fxt_block::{BlockDevice, MemBlockDevice};
use fxt_error::{FxtError, Result};
use fxt_types::{BlockGroupFlags, SZ_1G, SZ_1M, SZ_32M, SZ_256M};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// When freed ranges are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardMode {
    #[default]
    None,
    /// Discard at commit, before the range returns to free space.
    Sync,
}

/// Options fixed for the life of a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub sectorsize: u64,
    pub nodesize: u32,
    /// Tree block extents are keyed by level instead of length.
    pub skinny_metadata: bool,
    /// Record the owning root of every data extent inline.
    pub simple_quota: bool,
    pub discard: DiscardMode,
    pub ssd: bool,
    pub ssd_spread: bool,
    pub zoned: bool,
    pub size_classes: bool,
    pub max_discard_chunk_size: u64,
    pub data_chunk_size: u64,
    pub metadata_chunk_size: u64,
    pub system_chunk_size: u64,
    /// Allocate tree blocks on the split-allocation pool.
    pub offload_split_alloc: bool,
    pub split_workers: usize,
    /// Ready heads beyond which `throttle` drains a batch.
    pub delayed_refs_throttle_heads: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            sectorsize: 4096,
            nodesize: 16_384,
            skinny_metadata: true,
            simple_quota: false,
            discard: DiscardMode::None,
            ssd: false,
            ssd_spread: false,
            zoned: false,
            size_classes: true,
            max_discard_chunk_size: SZ_1G,
            data_chunk_size: SZ_1G,
            metadata_chunk_size: SZ_256M,
            system_chunk_size: SZ_32M,
            offload_split_alloc: false,
            split_workers: 2,
            delayed_refs_throttle_heads: 8192,
        }
    }
}

impl MountOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.sectorsize.is_power_of_two() || self.sectorsize < 512 {
            return Err(FxtError::InvalidGeometry(format!(
                "sectorsize {} is not a power of two of at least 512",
                self.sectorsize
            )));
        }
        if !self.nodesize.is_power_of_two() || u64::from(self.nodesize) < self.sectorsize {
            return Err(FxtError::InvalidGeometry(format!(
                "nodesize {} must be a power of two no smaller than sectorsize {}",
                self.nodesize, self.sectorsize
            )));
        }
        if self.nodesize > 65_536 {
            return Err(FxtError::InvalidGeometry(format!(
                "nodesize {} exceeds 64KiB",
                self.nodesize
            )));
        }
        for (name, size) in [
            ("data_chunk_size", self.data_chunk_size),
            ("metadata_chunk_size", self.metadata_chunk_size),
            ("system_chunk_size", self.system_chunk_size),
        ] {
            if size < SZ_1M || size % SZ_1M != 0 {
                return Err(FxtError::InvalidGeometry(format!(
                    "{name} {size} is not a positive multiple of 1MiB"
                )));
            }
        }
        if self.offload_split_alloc && self.split_workers == 0 {
            return Err(FxtError::InvalidGeometry(
                "split allocation offload needs at least one worker".to_owned(),
            ));
        }
        Ok(())
    }

    /// Allocator settings; `zone_size` comes from the devices.
    #[must_use]
    pub fn alloc_config(&self, zone_size: u64) -> AllocConfig {
        AllocConfig {
            sectorsize: self.sectorsize,
            nodesize: self.nodesize,
            ssd: self.ssd,
            ssd_spread: self.ssd_spread,
            zoned: self.zoned,
            zone_size,
            size_classes: self.size_classes,
            discard_sync: self.discard == DiscardMode::Sync,
            max_discard_chunk_size: self.max_discard_chunk_size,
            data_chunk_size: self.data_chunk_size,
            metadata_chunk_size: self.metadata_chunk_size,
            system_chunk_size: self.system_chunk_size,
            ..AllocConfig::default()
        }
    }
}

// ── Layout ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub devid: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub zone_size: Option<u64>,
    /// Zero disables discard on the device.
    #[serde(default)]
    pub max_discard_sectors: Option<u64>,
}

impl DeviceSpec {
    #[must_use]
    pub fn new(devid: u64, total_bytes: u64) -> Self {
        Self {
            devid,
            total_bytes,
            read_only: false,
            zone_size: None,
            max_discard_sectors: None,
        }
    }

    /// An in-memory device recording every command it receives.
    #[must_use]
    pub fn mem_device(&self) -> MemBlockDevice {
        let mut dev = MemBlockDevice::new(self.devid, self.total_bytes);
        if self.read_only {
            dev = dev.read_only();
        }
        if let Some(zone_size) = self.zone_size {
            dev = dev.zoned(zone_size);
        }
        if let Some(sectors) = self.max_discard_sectors {
            dev = dev.with_max_discard_sectors(sectors);
        }
        dev
    }
}

/// Chunks to allocate at open, before any extent is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub flags: BlockGroupFlags,
    #[serde(default = "one")]
    pub count: usize,
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsLayout {
    /// Logical address of the first chunk.
    pub first_logical: u64,
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

impl Default for FsLayout {
    fn default() -> Self {
        Self {
            first_logical: SZ_1M,
            devices: vec![DeviceSpec::new(1, 8 * SZ_1G)],
            groups: Vec::new(),
        }
    }
}

impl FsLayout {
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(FxtError::InvalidGeometry("layout has no devices".to_owned()));
        }
        let mut ids: Vec<u64> = self.devices.iter().map(|d| d.devid).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.devices.len() {
            return Err(FxtError::InvalidGeometry("duplicate device id".to_owned()));
        }
        let zone_sizes: Vec<Option<u64>> = self.devices.iter().map(|d| d.zone_size).collect();
        if zone_sizes.windows(2).any(|w| w[0] != w[1]) {
            return Err(FxtError::InvalidGeometry(
                "devices disagree on the zone size".to_owned(),
            ));
        }
        Ok(())
    }

    /// Zone size shared by the devices; zero when they are not zoned.
    #[must_use]
    pub fn zone_size(&self) -> u64 {
        self.devices
            .first()
            .and_then(|d| d.zone_size)
            .unwrap_or(0)
    }

    /// Build the in-memory devices of the layout.
    ///
    /// The concrete handles are returned alongside the trait objects so
    /// callers can inspect the recorded commands.
    #[must_use]
    pub fn mem_devices(&self) -> Vec<(Arc<MemBlockDevice>, Arc<dyn BlockDevice>)> {
        self.devices
            .iter()
            .map(|spec| {
                let dev = Arc::new(spec.mem_device());
                let erased: Arc<dyn BlockDevice> = Arc::clone(&dev) as Arc<dyn BlockDevice>;
                (dev, erased)
            })
            .collect()
    }
}
