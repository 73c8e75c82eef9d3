//! Ranges freed inside the running transaction.
//!
//! A pinned range stays out of the free pool until the transaction that freed
//! it commits. Ranges pinned by an aborted transaction are stranded: they stay
//! pinned for the life of the mount.

use fxt_types::PhysRange;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Interval set of byte ranges, adjacent and overlapping inserts merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinnedExtents {
    ranges: BTreeMap<u64, u64>,
}

impl PinnedExtents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.ranges.values().sum()
    }

    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start.saturating_add(len);
        if let Some((&s, &l)) = self.ranges.range(..=start).next_back() {
            if s + l >= start {
                new_start = s;
                new_end = new_end.max(s + l);
                self.ranges.remove(&s);
            }
        }
        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(new_start..=new_end)
            .map(|(&s, &l)| (s, l))
            .collect();
        for (s, l) in absorbed {
            self.ranges.remove(&s);
            new_end = new_end.max(s + l);
        }
        self.ranges.insert(new_start, new_end - new_start);
    }

    /// Whether any byte of `range` is pinned.
    #[must_use]
    pub fn overlaps(&self, range: PhysRange) -> bool {
        if range.is_empty() {
            return false;
        }
        if let Some((&s, &l)) = self.ranges.range(..=range.start).next_back() {
            if s + l > range.start {
                return true;
            }
        }
        self.ranges.range(range.start..range.end()).next().is_some()
    }

    /// Pinned pieces of `[start, end)`.
    #[must_use]
    pub fn pieces_in(&self, start: u64, end: u64) -> Vec<PhysRange> {
        if start >= end {
            return Vec::new();
        }
        let window = PhysRange::new(start, end - start);
        let first = self
            .ranges
            .range(..=start)
            .next_back()
            .map_or(start, |(&s, _)| s);
        self.ranges
            .range(first..end)
            .filter_map(|(&s, &l)| PhysRange::new(s, l).intersect(window))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysRange> + '_ {
        self.ranges.iter().map(|(&s, &l)| PhysRange::new(s, l))
    }

    /// Empty the set, returning its ranges in address order.
    pub fn drain(&mut self) -> Vec<PhysRange> {
        std::mem::take(&mut self.ranges)
            .into_iter()
            .map(|(s, l)| PhysRange::new(s, l))
            .collect()
    }

    fn absorb(&mut self, other: Self) {
        for (s, l) in other.ranges {
            self.insert(s, l);
        }
    }
}

#[derive(Debug, Default)]
struct PinState {
    current: PinnedExtents,
    stranded: PinnedExtents,
}

/// The running transaction's pinned set plus ranges stranded by aborts.
#[derive(Debug, Default)]
pub struct PinTracker {
    state: Mutex<PinState>,
}

impl PinTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, start: u64, len: u64) {
        self.state.lock().current.insert(start, len);
    }

    /// Whether any byte of `range` is pinned, by the running transaction or
    /// by an aborted one.
    #[must_use]
    pub fn is_pinned(&self, range: PhysRange) -> bool {
        let state = self.state.lock();
        state.current.overlaps(range) || state.stranded.overlaps(range)
    }

    /// Every pinned piece of `[start, end)`, stranded ranges included.
    #[must_use]
    pub fn pinned_in(&self, start: u64, end: u64) -> Vec<PhysRange> {
        let state = self.state.lock();
        let mut all = state.current.clone();
        all.absorb(state.stranded.clone());
        all.pieces_in(start, end)
    }

    #[must_use]
    pub fn current(&self) -> PinnedExtents {
        self.state.lock().current.clone()
    }

    #[must_use]
    pub fn stranded(&self) -> PinnedExtents {
        self.state.lock().stranded.clone()
    }

    /// Hand the running transaction's ranges to the commit path.
    pub fn take_for_commit(&self) -> Vec<PhysRange> {
        self.state.lock().current.drain()
    }

    /// Move the running transaction's ranges to the stranded set.
    pub fn strand(&self) -> Vec<PhysRange> {
        let mut state = self.state.lock();
        let ranges = state.current.drain();
        for range in &ranges {
            state.stranded.insert(range.start, range.len);
        }
        ranges
    }
}
