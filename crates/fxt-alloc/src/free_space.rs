//! Per-group free-space index.
//!
//! Free extents are kept in two orders: by start offset (for neighbour
//! coalescing and hinted searches) and by size, largest first (for searches
//! that start at the group's first byte). Entries never overlap and adjacent
//! entries are always merged.
//!
//! Entries lent to a [`FreeCluster`](crate::cluster::FreeCluster) leave both
//! indexes but still count toward [`FreeSpaceCtl::free_space`] until the
//! cluster allocates them or hands them back.

use fxt_error::{FxtError, Result};
use fxt_types::{PhysRange, round_up_from};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct FreeSpaceCtl {
    /// Alignment origin: the owning group's first byte.
    start: u64,
    /// Allocation unit (sector size).
    unit: u64,
    by_offset: BTreeMap<u64, u64>,
    by_bytes: BTreeSet<(Reverse<u64>, u64)>,
    indexed: u64,
    lent: u64,
}

impl FreeSpaceCtl {
    #[must_use]
    pub fn new(start: u64, unit: u64) -> Self {
        Self {
            start,
            unit: unit.max(1),
            by_offset: BTreeMap::new(),
            by_bytes: BTreeSet::new(),
            indexed: 0,
            lent: 0,
        }
    }

    /// Free bytes, including bytes lent to a cluster.
    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.indexed + self.lent
    }

    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.by_offset.len()
    }

    /// Size of the largest indexed extent.
    #[must_use]
    pub fn largest(&self) -> u64 {
        self.by_bytes.first().map_or(0, |(Reverse(len), _)| *len)
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysRange> + '_ {
        self.by_offset
            .iter()
            .map(|(&start, &len)| PhysRange::new(start, len))
    }

    fn link(&mut self, start: u64, len: u64) {
        self.by_offset.insert(start, len);
        self.by_bytes.insert((Reverse(len), start));
        self.indexed += len;
    }

    fn unlink(&mut self, start: u64) -> Option<u64> {
        let len = self.by_offset.remove(&start)?;
        self.by_bytes.remove(&(Reverse(len), start));
        self.indexed -= len;
        Some(len)
    }

    /// Indexed extent containing `offset`, if any.
    fn containing(&self, offset: u64) -> Option<(u64, u64)> {
        self.by_offset
            .range(..=offset)
            .next_back()
            .map(|(&s, &l)| (s, l))
            .filter(|&(s, l)| offset < s.saturating_add(l))
    }

    /// Return `[start, start + len)` to the pool, merging with neighbours.
    ///
    /// Overlap with an existing free extent is rejected with `Exists`, which
    /// callers treat as a double free.
    pub fn add_free_space(&mut self, start: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let range = PhysRange::new(start, len);
        let prev = self.by_offset.range(..=start).next_back().map(|(&s, &l)| (s, l));
        let next = self.by_offset.range(start..).next().map(|(&s, &l)| (s, l));
        if prev.is_some_and(|(s, l)| PhysRange::new(s, l).overlaps(range))
            || next.is_some_and(|(s, l)| PhysRange::new(s, l).overlaps(range))
        {
            return Err(FxtError::Exists(format!("free space {range} overlaps free extent")));
        }

        let mut merged_start = start;
        let mut merged_len = len;
        if let Some((s, l)) = prev.filter(|&(s, l)| s + l == start) {
            self.unlink(s);
            merged_start = s;
            merged_len += l;
        }
        if let Some((s, l)) = next.filter(|&(s, _)| s == range.end()) {
            self.unlink(s);
            merged_len += l;
        }
        self.link(merged_start, merged_len);
        Ok(())
    }

    /// Take `[start, start + len)` out of the pool.
    ///
    /// The whole range must currently be free; otherwise nothing changes and
    /// `NotFound` is returned.
    pub fn remove_free_space(&mut self, start: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = start.saturating_add(len);
        let mut cursor = start;
        let mut pieces = Vec::new();
        while cursor < end {
            let Some((s, l)) = self.containing(cursor) else {
                return Err(FxtError::NotFound(format!(
                    "free space [{start}, +{len}) not free at {cursor}"
                )));
            };
            pieces.push((s, l));
            cursor = s + l;
        }
        for (s, l) in pieces {
            self.unlink(s);
            if s < start {
                self.link(s, start - s);
            }
            if s + l > end {
                self.link(end, s + l - end);
            }
        }
        Ok(())
    }

    /// Whether any byte of `range` is free.
    #[must_use]
    pub fn overlaps_free(&self, range: PhysRange) -> bool {
        if self.containing(range.start).is_some() {
            return true;
        }
        self.by_offset
            .range(range.start..range.end())
            .next()
            .is_some()
    }

    /// Carve `bytes` out of the first extent that can hold
    /// `bytes + empty_size` at an `align`-aligned start.
    ///
    /// Searching from the group's first byte walks extents largest first;
    /// any other `offset` walks in address order from the extent containing
    /// it. The bytes skipped to reach alignment stay free. On a miss,
    /// returns the largest extent examined.
    pub fn find_space_for_alloc(
        &mut self,
        offset: u64,
        bytes: u64,
        empty_size: u64,
        align: u64,
    ) -> std::result::Result<u64, u64> {
        let want = bytes.saturating_add(empty_size);
        let align = align.max(self.unit);
        let mut max_extent = 0_u64;

        let candidates: Vec<(u64, u64)> = if offset == self.start {
            self.by_bytes
                .iter()
                .map(|&(Reverse(len), start)| (start, len))
                .collect()
        } else {
            let first = self
                .containing(offset)
                .map_or(offset, |(s, _)| s);
            self.by_offset
                .range(first..)
                .map(|(&s, &l)| (s, l))
                .collect()
        };

        for (start, len) in candidates {
            if len < want {
                max_extent = max_extent.max(len);
                if offset == self.start {
                    // Size order: nothing after this is larger.
                    break;
                }
                continue;
            }
            let aligned = if want >= align {
                round_up_from(start, self.start, align).unwrap_or(start)
            } else {
                start
            };
            let gap = aligned - start;
            if len < want.saturating_add(gap) {
                max_extent = max_extent.max(len);
                continue;
            }
            self.unlink(start);
            if gap > 0 {
                self.link(start, gap);
            }
            let rest = len - gap - bytes;
            if rest > 0 {
                self.link(aligned + bytes, rest);
            }
            return Ok(aligned);
        }
        Err(max_extent)
    }

    /// Move every extent at or after `offset` of at least `min_bytes` into a
    /// cluster window, if together they hold `bytes` and one of them holds
    /// `cont1_bytes`.
    pub fn lend_window(
        &mut self,
        offset: u64,
        bytes: u64,
        cont1_bytes: u64,
        min_bytes: u64,
    ) -> Option<BTreeMap<u64, u64>> {
        let first = self.containing(offset).map_or(offset, |(s, _)| s);
        let eligible: Vec<(u64, u64)> = self
            .by_offset
            .range(first..)
            .map(|(&s, &l)| (s, l))
            .filter(|&(_, l)| l >= min_bytes)
            .collect();
        let window_free: u64 = eligible.iter().map(|&(_, l)| l).sum();
        let max_extent = eligible.iter().map(|&(_, l)| l).max().unwrap_or(0);
        if eligible.is_empty() || window_free < bytes || max_extent < cont1_bytes {
            return None;
        }
        let mut window = BTreeMap::new();
        for (s, l) in eligible {
            self.unlink(s);
            window.insert(s, l);
        }
        self.lent += window_free;
        Some(window)
    }

    /// Bytes allocated out of a lent window leave the pool for good.
    pub fn consume_lent(&mut self, bytes: u64) {
        self.lent = self.lent.saturating_sub(bytes);
    }

    /// Take back whatever a cluster did not allocate.
    pub fn return_lent(&mut self, window: BTreeMap<u64, u64>) -> Result<()> {
        for (s, l) in window {
            self.lent = self.lent.saturating_sub(l);
            self.add_free_space(s, l)?;
        }
        Ok(())
    }

    /// Free extents overlapping `[start, end)`, clipped to it.
    #[must_use]
    pub fn extents_in(&self, start: u64, end: u64) -> Vec<PhysRange> {
        if start >= end {
            return Vec::new();
        }
        let first = self.containing(start).map_or(start, |(s, _)| s);
        self.by_offset
            .range(first..end)
            .filter_map(|(&s, &l)| PhysRange::new(s, l).intersect(PhysRange::new(start, end - start)))
            .collect()
    }
}
