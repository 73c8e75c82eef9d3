//! Transaction handles.
//!
//! One transaction runs at a time. Handles started while it runs join it;
//! the transaction commits when its last handle calls [`TransHandle::commit`].
//!
//! A handle carries the [`Cx`] it was started under. Long-running work done
//! through the handle (the delayed-ref drain, extent searches, discards)
//! checks it for cancellation.

use crate::engine::ExtentTree;
use asupersync::Cx;
use fxt_delayed_ref::{DestroyReport, RunStats};
use fxt_error::Result;
use fxt_types::{PhysRange, TxnId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Bookkeeping of the running transaction.
#[derive(Debug, Default)]
pub(crate) struct TransState {
    pub last_committed: u64,
    pub transid: u64,
    pub running: bool,
    pub handles: usize,
    /// Tree blocks allocated by the running transaction.
    pub new_blocks: BTreeSet<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CommitReport {
    pub transid: u64,
    pub delayed_refs: RunStats,
    pub unpinned_bytes: u64,
    pub blocks_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AbortReport {
    pub transid: u64,
    pub errno: i32,
    pub destroyed: DestroyReport,
    /// Ranges that will not return to free space for the life of the mount.
    pub stranded: Vec<PhysRange>,
}

impl AbortReport {
    #[must_use]
    pub fn stranded_bytes(&self) -> u64 {
        self.stranded.iter().map(|r| r.len).sum()
    }
}

/// A reference to the running transaction.
///
/// Dropping a handle without committing leaves the transaction running for
/// the remaining handles.
pub struct TransHandle<'a> {
    tree: &'a ExtentTree,
    cx: &'a Cx,
    transid: u64,
    generation: u64,
    released: bool,
}

impl fmt::Debug for TransHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransHandle")
            .field("transid", &self.transid)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<'a> TransHandle<'a> {
    pub(crate) fn new(tree: &'a ExtentTree, cx: &'a Cx, transid: u64) -> Self {
        Self {
            tree,
            cx,
            transid,
            generation: transid,
            released: false,
        }
    }

    #[must_use]
    pub fn transid(&self) -> TxnId {
        TxnId(self.transid)
    }

    /// Generation stamped on items created under this handle.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn tree(&self) -> &'a ExtentTree {
        self.tree
    }

    #[must_use]
    pub fn cx(&self) -> &'a Cx {
        self.cx
    }

    /// Another handle on the same transaction, under the same `Cx`.
    pub fn join(&self) -> Result<TransHandle<'a>> {
        self.tree.join_transaction(self.cx, self.transid)
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.tree.state().aborted().is_some()
    }

    /// Drain a batch of delayed refs once too many heads are ready.
    pub fn throttle(&self) -> Result<Option<RunStats>> {
        self.tree.throttle(self)
    }

    /// Commit once this is the last handle.
    ///
    /// A commit cancelled through the handle's `Cx` leaves the transaction
    /// running with its queue intact; a new handle can commit it later.
    pub fn commit(mut self) -> Result<CommitReport> {
        self.released = true;
        self.tree.commit_transaction(self.cx, self.transid)
    }

    /// Abort the whole transaction, including its other handles.
    pub fn abort(mut self, errno: i32) -> AbortReport {
        self.released = true;
        self.tree.abort_transaction(self.transid, errno)
    }
}

impl Drop for TransHandle<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.tree.release_handle(self.transid);
        }
    }
}
