//! Sequence barrier for back-reference walkers.
//!
//! A walker that resolves back-references against a consistent view takes a
//! sequence number first. Delayed refs queued for fs trees while that number
//! is live carry a sequence at or above it and are held back until the
//! walker puts its number.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct SeqState {
    current: u64,
    /// Live sequence numbers and how many holders each has.
    live: BTreeMap<u64, usize>,
}

/// Fs-wide sequence counter and the set of live walkers.
#[derive(Debug, Default)]
pub struct TreeModLog {
    state: Mutex<SeqState>,
}

impl TreeModLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence stamped on newly queued fs-tree refs.
    #[must_use]
    pub fn current_seq(&self) -> u64 {
        self.state.lock().current
    }

    /// Start a walker: bump the counter and register the new value.
    pub fn get_seq(&self) -> u64 {
        let mut state = self.state.lock();
        state.current += 1;
        let seq = state.current;
        *state.live.entry(seq).or_default() += 1;
        seq
    }

    /// End a walker started with [`TreeModLog::get_seq`].
    pub fn put_seq(&self, seq: u64) {
        let mut state = self.state.lock();
        if let Some(holders) = state.live.get_mut(&seq) {
            *holders -= 1;
            if *holders == 0 {
                state.live.remove(&seq);
            }
        } else {
            tracing::warn!(seq, "put of a sequence number that is not live");
        }
    }

    /// Oldest live walker, if any.
    #[must_use]
    pub fn lowest_seq(&self) -> Option<u64> {
        self.state.lock().live.keys().next().copied()
    }

    #[must_use]
    pub fn has_users(&self) -> bool {
        !self.state.lock().live.is_empty()
    }

    /// Whether a node stamped with `seq` must wait for a live walker.
    #[must_use]
    pub fn blocks(&self, seq: u64) -> bool {
        seq != 0 && self.lowest_seq().is_some_and(|lowest| seq >= lowest)
    }

    /// Scoped walker; the sequence is put when the guard drops.
    #[must_use]
    pub fn reader(self: &Arc<Self>) -> SeqReader {
        let seq = self.get_seq();
        SeqReader {
            log: Arc::clone(self),
            seq,
        }
    }
}

/// Live sequence number held for the guard's lifetime.
#[derive(Debug)]
pub struct SeqReader {
    log: Arc<TreeModLog>,
    seq: u64,
}

impl SeqReader {
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for SeqReader {
    fn drop(&mut self) {
        self.log.put_seq(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_nodes_stamped_after_a_reader_are_blocked() {
        let log = Arc::new(TreeModLog::new());
        let before = log.current_seq();
        let reader = log.reader();
        let after = log.current_seq();
        assert!(!log.blocks(before));
        assert!(log.blocks(after));
        assert!(!log.blocks(0));
        drop(reader);
        assert!(!log.blocks(after));
        assert!(!log.has_users());
    }

    #[test]
    fn lowest_seq_tracks_the_oldest_reader() {
        let log = TreeModLog::new();
        let first = log.get_seq();
        let second = log.get_seq();
        assert_eq!(log.lowest_seq(), Some(first));
        log.put_seq(first);
        assert_eq!(log.lowest_seq(), Some(second));
        log.put_seq(second);
        assert_eq!(log.lowest_seq(), None);
    }
}
