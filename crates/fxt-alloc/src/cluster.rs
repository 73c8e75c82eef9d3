//! Free clusters: a window of free extents borrowed from one group so that
//! consecutive allocations land next to each other.

use crate::block_group::BlockGroup;
use fxt_error::{FxtError, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Default)]
pub struct ClusterState {
    /// Start of the group the window was borrowed from.
    pub block_group: Option<u64>,
    pub window_start: u64,
    /// Largest extent in the window when it was built.
    pub max_size: u64,
    pub entries: BTreeMap<u64, u64>,
    /// Set once an allocation had to bypass the cluster; cleared after
    /// enough space is unpinned in a group.
    pub fragmented: bool,
}

/// One cluster per allocation kind (metadata, data).
///
/// Lock order: cluster, then group.
#[derive(Debug, Default)]
pub struct FreeCluster {
    state: Mutex<ClusterState>,
}

impl FreeCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock()
    }

    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        self.state.lock().fragmented
    }

    pub fn set_fragmented(&self, fragmented: bool) {
        self.state.lock().fragmented = fragmented;
    }
}

/// Sizing rules for building a window.
#[derive(Debug, Clone, Copy)]
pub struct ClusterPolicy {
    pub ssd_spread: bool,
    pub sectorsize: u64,
}

impl ClusterPolicy {
    /// `(cont1_bytes, min_bytes)`: one extent of the window must hold
    /// `cont1_bytes` and no extent smaller than `min_bytes` joins it.
    #[must_use]
    pub fn window_bounds(self, bg: &BlockGroup, bytes: u64, empty_size: u64) -> (u64, u64) {
        if self.ssd_spread {
            let cont1 = bytes.saturating_add(empty_size);
            (cont1, cont1)
        } else if bg.flags().contains(fxt_types::BlockGroupFlags::METADATA) {
            (bytes, self.sectorsize)
        } else {
            (bytes.max(bytes.saturating_add(empty_size) >> 2), self.sectorsize)
        }
    }
}

impl ClusterState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block_group.is_none()
    }

    /// Borrow a window of at least `bytes + empty_size` free bytes from `bg`,
    /// starting at or after `offset`.
    ///
    /// A cluster that already holds a window is left alone.
    pub fn refill(
        &mut self,
        bg: &BlockGroup,
        policy: ClusterPolicy,
        offset: u64,
        bytes: u64,
        empty_size: u64,
    ) -> Result<()> {
        let (cont1_bytes, min_bytes) = policy.window_bounds(bg, bytes, empty_size);
        let mut state = bg.lock();
        if state.free_space.free_space() < bytes {
            return Err(FxtError::NoSpace { max_extent_size: 0 });
        }
        if self.block_group.is_some() {
            return Ok(());
        }
        let window = state
            .free_space
            .lend_window(offset, bytes.saturating_add(empty_size), cont1_bytes, min_bytes)
            .ok_or(FxtError::NoSpace { max_extent_size: 0 })?;
        self.window_start = window.keys().next().copied().unwrap_or(offset);
        self.max_size = window.values().copied().max().unwrap_or(0);
        self.entries = window;
        self.block_group = Some(bg.start());
        trace!(
            group = bg.start(),
            window_start = self.window_start,
            max_size = self.max_size,
            "cluster refilled"
        );
        Ok(())
    }

    /// Carve `bytes` out of the window at or after `min_start`.
    ///
    /// On a miss returns the largest window entry that was too small.
    pub fn alloc(&mut self, bg: &BlockGroup, bytes: u64, min_start: u64) -> std::result::Result<u64, u64> {
        if self.block_group != Some(bg.start()) || bytes > self.max_size {
            return Err(0);
        }
        let mut max_extent = 0_u64;
        let mut hit = None;
        for (&start, &len) in &self.entries {
            if len < bytes {
                max_extent = max_extent.max(len);
                continue;
            }
            if start < min_start {
                continue;
            }
            hit = Some((start, len));
            break;
        }
        let Some((start, len)) = hit else {
            return Err(max_extent);
        };
        self.entries.remove(&start);
        if len > bytes {
            self.entries.insert(start + bytes, len - bytes);
        }
        self.window_start = start + bytes;
        bg.lock().free_space.consume_lent(bytes);
        Ok(start)
    }

    /// Give every unallocated window byte back to `bg` and detach.
    pub fn release(&mut self, bg: &BlockGroup) -> Result<()> {
        if self.block_group != Some(bg.start()) {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.entries);
        self.block_group = None;
        self.window_start = 0;
        self.max_size = 0;
        bg.lock().free_space.return_lent(entries)
    }
}
