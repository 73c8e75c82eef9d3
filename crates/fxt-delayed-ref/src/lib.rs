#![forbid(unsafe_code)]
//! Delayed reference processing.
//!
//! Reference changes made while a transaction runs are not applied to the
//! extent tree directly. They are queued per extent ([`DelayedRefHead`]) as
//! [`RefNode`]s, cancelled against each other where possible, and drained in
//! bytenr order by [`DelayedRefRoot::run`] through a [`RefRunner`].
//!
//! ## Accounting
//!
//! For every head, `ref_mod` equals the net delta of its queued nodes. The
//! queue holds one reservation unit per live head and per live node, so an
//! empty queue holds none.
//!
//! ## Ordering
//!
//! Within a head, the node that creates the extent item drains first, then
//! the remaining adds, then the drops. Nodes queued for fs trees carry a
//! [`TreeModLog`] sequence and wait for older back-reference walkers.

pub mod head;
pub mod node;
pub mod root;
pub mod tree_mod_log;

pub use head::{DelayedRefHead, HeadPeek, HeadView};
pub use node::{DelayedRef, RefAction, RefKind, RefNode};
pub use root::{DelayedRefRoot, DelayedRefsSnapshot, DestroyReport, RefRunner, RunStats};
pub use tree_mod_log::{SeqReader, TreeModLog};
