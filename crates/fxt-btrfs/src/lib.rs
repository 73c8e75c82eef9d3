#![forbid(unsafe_code)]
//! Tree blocks and snapshot drop.
//!
//! [`TreeBlock`] is the decoded form of a checksummed tree block, with the
//! header validation a reader applies against its parent pointer.
//! [`child_refs`] lists the references a block holds on its children, and
//! [`drop_snapshot`] walks a dead tree releasing them. The walker is
//! I/O-agnostic: callers supply block reads and reference updates through
//! [`DropEnv`].

pub mod block;
pub mod refs;
pub mod store;
pub mod walk;

pub use block::{
    BlockBody, BlockCheck, FileExtent, HEADER_FLAG_WRITTEN, LeafItem, NodePtr, TreeBlock,
};
pub use refs::{BlockRef, RefChange, child_refs};
pub use store::BlockStore;
pub use walk::{
    DropEnv, DropReport, DropStats, DropStatus, ExtentInfo, RootItem, drop_snapshot,
};
