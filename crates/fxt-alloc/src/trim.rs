//! Discarding free space.
//!
//! A free extent being trimmed is pulled out of the free-space index and
//! counted as reserved for the duration of the discard, so no allocation can
//! hand it out mid-command. Cancellation lands between extents, after the
//! one in flight is back in the index.

use crate::allocator::FsAlloc;
use crate::block_group::BlockGroup;
use asupersync::Cx;
use fxt_error::{FxtError, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of [`FsAlloc::trim_fs`].
#[derive(Debug, Default, Serialize)]
pub struct TrimReport {
    pub trimmed: u64,
    pub bg_failed: u64,
    pub dev_failed: u64,
    #[serde(skip)]
    pub bg_error: Option<FxtError>,
    #[serde(skip)]
    pub dev_error: Option<FxtError>,
}

impl TrimReport {
    /// The first group error wins over a device error.
    pub fn into_result(self) -> Result<u64> {
        match (self.bg_error, self.dev_error) {
            (Some(err), _) | (None, Some(err)) => Err(err),
            (None, None) => Ok(self.trimmed),
        }
    }
}

impl FsAlloc {
    /// Discard a logical range on every device stripe behind it.
    pub fn discard_extent(&self, cx: &Cx, start: u64, len: u64) -> Result<u64> {
        self.volumes
            .discard_logical(cx, start, len, self.config.max_discard_chunk_size)
    }

    /// Discard the free extents of at least `min_len` bytes inside
    /// `[start, end)` of `bg`.
    pub fn trim_block_group(
        &self,
        cx: &Cx,
        bg: &BlockGroup,
        start: u64,
        end: u64,
        min_len: u64,
    ) -> Result<u64> {
        if bg.is_zoned() {
            return Ok(0);
        }
        self.cache_block_group(cx, bg, true)?;
        let start = start.max(bg.start());
        let end = end.min(bg.end());
        let candidates = bg.lock().free_space.extents_in(start, end);
        let mut trimmed = 0_u64;
        for extent in candidates.into_iter().filter(|e| e.len >= min_len.max(1)) {
            cx.checkpoint().map_err(|_| FxtError::Cancelled)?;
            {
                let mut sinfo = bg.space_info().lock();
                let mut state = bg.lock();
                if state.free_space.remove_free_space(extent.start, extent.len).is_err() {
                    // Allocated since the snapshot.
                    continue;
                }
                state.reserved += extent.len;
                sinfo.counters.bytes_reserved += extent.len;
            }
            let discarded = self.discard_extent(cx, extent.start, extent.len);
            {
                let mut sinfo = bg.space_info().lock();
                let mut state = bg.lock();
                state.free_space.add_free_space(extent.start, extent.len)?;
                state.reserved = state.reserved.saturating_sub(extent.len);
                sinfo.counters.bytes_reserved = sinfo.counters.bytes_reserved.saturating_sub(extent.len);
            }
            trimmed += discarded?;
        }
        debug!(group = bg.start(), trimmed, "trimmed block group");
        Ok(trimmed)
    }

    /// Trim free space in every group overlapping `[start, start + len)`,
    /// then every unallocated device hole.
    ///
    /// A failing group is counted and skipped; the device pass stops at the
    /// first failing device. Cancellation ends both passes and is reported
    /// as the group error.
    pub fn trim_fs(&self, cx: &Cx, start: u64, len: u64, min_len: u64) -> TrimReport {
        let end = start.saturating_add(len);
        let mut report = TrimReport::default();
        for bg in self.block_groups() {
            if bg.end() <= start || bg.start() >= end {
                continue;
            }
            let from = start.max(bg.start());
            let to = end.min(bg.end());
            if to - from < min_len {
                continue;
            }
            match self.trim_block_group(cx, &bg, from, to, min_len) {
                Ok(done) => report.trimmed += done,
                Err(FxtError::Cancelled) => {
                    report.bg_error = Some(FxtError::Cancelled);
                    return report;
                }
                Err(err) => {
                    warn!(group = bg.start(), error = %err, "failed to trim block group");
                    report.bg_failed += 1;
                    report.bg_error.get_or_insert(err);
                }
            }
        }

        for devid in self.volumes.device_ids() {
            if !self.volumes.is_present(devid) {
                continue;
            }
            match self
                .volumes
                .trim_free_extents(cx, devid, min_len, self.config.max_discard_chunk_size)
            {
                Ok(done) => report.trimmed += done,
                Err(err) => {
                    report.dev_failed += 1;
                    report.dev_error = Some(err);
                    break;
                }
            }
        }
        info!(
            trimmed = report.trimmed,
            bg_failed = report.bg_failed,
            dev_failed = report.dev_failed,
            "trim finished"
        );
        report
    }
}
