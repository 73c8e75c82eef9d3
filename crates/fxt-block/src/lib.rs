#![forbid(unsafe_code)]
//! Block device capability consumed by the extent engine.
//!
//! The engine never reads or writes file data. It only needs to tell devices
//! that ranges are unused (`discard`), to rewind zoned devices
//! (`zone_reset`), and to know whether a device accepts either command. The
//! [`BlockDevice`] trait captures that capability; [`volumes`] maps logical
//! chunk addresses onto device stripes.

pub mod volumes;

use asupersync::Cx;
use fxt_error::{FxtError, Result};
use fxt_types::{
    BTRFS_SUPER_INFO_SIZE, BTRFS_SUPER_MIRROR_MAX, DeviceId, PhysRange, super_mirror_offset,
};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

pub use volumes::{Chunk, Stripe, Volumes};

/// Discards are issued in units of 512-byte sectors.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| FxtError::Cancelled)
}

/// Device-level capability: discard, zone reset, writability.
pub trait BlockDevice: Send + Sync {
    /// Device id inside the filesystem.
    fn devid(&self) -> DeviceId;

    /// Total addressable bytes.
    fn total_bytes(&self) -> u64;

    /// Whether writes (and therefore discards) are accepted.
    fn is_writable(&self) -> bool;

    /// Largest discard the device accepts, in 512-byte sectors. Zero means
    /// discard is unsupported.
    fn max_discard_sectors(&self) -> u64;

    /// Zone size in bytes for zoned devices.
    fn zone_size(&self) -> Option<u64> {
        None
    }

    /// Tell the device `[start, start + len)` holds no live data.
    ///
    /// Returns `UnsupportedFeature` when the device cannot discard.
    fn discard(&self, cx: &Cx, start: u64, len: u64) -> Result<()>;

    /// Rewind the write pointer of every zone in `[start, start + len)`.
    fn zone_reset(&self, cx: &Cx, start: u64, len: u64) -> Result<()>;
}

/// Discard `[start, start + len)` on `dev`, skipping every superblock copy
/// and splitting the remainder into commands of at most `max_chunk` bytes.
///
/// The range is first trimmed to 512-byte sector alignment. A device that
/// reports discard as unsupported ends the loop quietly; other errors are
/// returned. Cancellation is checked before every command, so a cancelled
/// `cx` leaves the already discarded prefix in place and returns
/// `Cancelled`. Returns the number of bytes actually discarded.
pub fn issue_discard(
    cx: &Cx,
    dev: &dyn BlockDevice,
    start: u64,
    len: u64,
    max_chunk: u64,
) -> Result<u64> {
    let aligned_start = start
        .checked_add(SECTOR_SIZE - 1)
        .map(|v| v & !(SECTOR_SIZE - 1))
        .ok_or_else(|| FxtError::InvalidArgument(format!("discard start {start} overflows")))?;
    let mut len = len;
    let mut start = start;
    if start != aligned_start {
        len = len.saturating_sub(aligned_start - start) & !(SECTOR_SIZE - 1);
        start = aligned_start;
    }
    if len == 0 {
        return Ok(0);
    }

    let device_limit = dev.max_discard_sectors().saturating_mul(SECTOR_SIZE);
    let chunk = match (max_chunk, device_limit) {
        (0, 0) => u64::MAX,
        (0, limit) | (limit, 0) => limit,
        (a, b) => a.min(b),
    };

    let mut discarded = 0_u64;
    for piece in skip_superblocks(PhysRange::new(start, len)) {
        let mut cursor = piece.start;
        let end = piece.end();
        while cursor < end {
            cx_checkpoint(cx)?;
            let step = (end - cursor).min(chunk);
            match dev.discard(cx, cursor, step) {
                Ok(()) => {
                    trace!(devid = dev.devid().0, start = cursor, len = step, "discard");
                    discarded += step;
                    cursor += step;
                }
                Err(FxtError::UnsupportedFeature(_)) => {
                    debug!(devid = dev.devid().0, "device does not support discard");
                    return Ok(discarded);
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(discarded)
}

/// Split `range` into the pieces that do not overlap any superblock copy.
///
/// Each copy occupies `[mirror, mirror + BTRFS_SUPER_INFO_SIZE)`.
#[must_use]
pub fn skip_superblocks(range: PhysRange) -> Vec<PhysRange> {
    let mut pieces = Vec::new();
    let mut start = range.start;
    let end = range.end();
    for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
        if start >= end {
            break;
        }
        let sb = PhysRange::new(super_mirror_offset(mirror), BTRFS_SUPER_INFO_SIZE);
        if !sb.overlaps(PhysRange::new(start, end - start)) {
            continue;
        }
        if sb.start > start {
            pieces.push(PhysRange::new(start, sb.start - start));
        }
        start = sb.end();
    }
    if start < end {
        pieces.push(PhysRange::new(start, end - start));
    }
    pieces
}

// ── File-backed device ──────────────────────────────────────────────────────

/// Image-file device. Discard zero-fills the range; zones are unsupported.
#[derive(Debug, Clone)]
pub struct FileDevice {
    devid: DeviceId,
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileDevice {
    pub fn open(devid: DeviceId, path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            devid,
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl BlockDevice for FileDevice {
    fn devid(&self) -> DeviceId {
        self.devid
    }

    fn total_bytes(&self) -> u64 {
        self.len
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn max_discard_sectors(&self) -> u64 {
        (u64::from(u32::MAX)) >> SECTOR_SHIFT
    }

    fn discard(&self, cx: &Cx, start: u64, len: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        if !self.writable {
            return Err(FxtError::ReadOnly);
        }
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.len)
            .ok_or_else(|| {
                FxtError::InvalidArgument(format!(
                    "discard out of bounds: start={start} len={len} file_len={}",
                    self.len
                ))
            })?;
        let zeros = vec![0_u8; 1 << 20];
        let mut cursor = start;
        while cursor < end {
            let step = usize::try_from((end - cursor).min(1 << 20)).unwrap_or(1 << 20);
            self.file.write_all_at(&zeros[..step], cursor)?;
            cursor += step as u64;
        }
        Ok(())
    }

    fn zone_reset(&self, _cx: &Cx, _start: u64, _len: u64) -> Result<()> {
        Err(FxtError::UnsupportedFeature("zone reset on image file".to_owned()))
    }
}

// ── Recording device ────────────────────────────────────────────────────────

/// One command observed by a [`MemBlockDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Discard { start: u64, len: u64 },
    ZoneReset { start: u64, len: u64 },
}

/// In-memory device that records every discard and zone reset.
#[derive(Debug)]
pub struct MemBlockDevice {
    devid: DeviceId,
    total_bytes: u64,
    writable: bool,
    max_discard_sectors: u64,
    zone_size: Option<u64>,
    fail_discard: Mutex<Option<i32>>,
    log: Mutex<Vec<DeviceCommand>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(devid: u64, total_bytes: u64) -> Self {
        Self {
            devid: DeviceId(devid),
            total_bytes,
            writable: true,
            max_discard_sectors: u64::MAX >> SECTOR_SHIFT,
            zone_size: None,
            fail_discard: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    #[must_use]
    pub fn with_max_discard_sectors(mut self, sectors: u64) -> Self {
        self.max_discard_sectors = sectors;
        self
    }

    #[must_use]
    pub fn zoned(mut self, zone_size: u64) -> Self {
        self.zone_size = Some(zone_size);
        self
    }

    /// Make every later discard fail with the raw os error `errno`.
    pub fn fail_discards_with(&self, errno: i32) {
        *self.fail_discard.lock() = Some(errno);
    }

    #[must_use]
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.log.lock().clone()
    }

    #[must_use]
    pub fn discarded_bytes(&self) -> u64 {
        self.log
            .lock()
            .iter()
            .map(|cmd| match cmd {
                DeviceCommand::Discard { len, .. } => *len,
                DeviceCommand::ZoneReset { .. } => 0,
            })
            .sum()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl BlockDevice for MemBlockDevice {
    fn devid(&self) -> DeviceId {
        self.devid
    }

    fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn max_discard_sectors(&self) -> u64 {
        self.max_discard_sectors
    }

    fn zone_size(&self) -> Option<u64> {
        self.zone_size
    }

    fn discard(&self, cx: &Cx, start: u64, len: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.max_discard_sectors == 0 {
            return Err(FxtError::UnsupportedFeature("discard".to_owned()));
        }
        if let Some(errno) = *self.fail_discard.lock() {
            return Err(FxtError::Io(std::io::Error::from_raw_os_error(errno)));
        }
        if start.saturating_add(len) > self.total_bytes {
            return Err(FxtError::InvalidArgument(format!(
                "discard past end of device: start={start} len={len}"
            )));
        }
        self.log.lock().push(DeviceCommand::Discard { start, len });
        Ok(())
    }

    fn zone_reset(&self, cx: &Cx, start: u64, len: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.zone_size.is_none() {
            return Err(FxtError::UnsupportedFeature("zone reset".to_owned()));
        }
        self.log.lock().push(DeviceCommand::ZoneReset { start, len });
        Ok(())
    }
}
