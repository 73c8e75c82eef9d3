#![forbid(unsafe_code)]
//! Transaction-scoped extent tree engine.
//!
//! [`ExtentTree`] ties the allocator, the extent items and the delayed-ref
//! queue together. Work happens under a [`TransHandle`]: space is reserved
//! at once, reference changes are queued, and the queue is applied to the
//! extent items when the transaction commits. An abort throws the queue
//! away and leaves the filesystem read-only.
//!
//! Snapshots share every block below the copied root; dropping a tree
//! releases its references, converting shared blocks to parent-keyed
//! back-references first.

pub mod config;
pub mod engine;
mod runner;
mod snapshot;
pub mod state;
pub mod trans;

pub use config::{DeviceSpec, DiscardMode, FsLayout, GroupSpec, MountOptions};
pub use engine::{EngineSnapshot, ExtentTree};
pub use runner::ref_identity;
pub use state::{FsState, FsStatus, Health};
pub use trans::{AbortReport, CommitReport, TransHandle};

pub use asupersync::Cx;
pub use fxt_alloc::{AllocRequest, AllocSnapshot, FoundExtent, LoopPhase, TrimReport};
pub use fxt_block::{BlockDevice, Chunk, DeviceCommand, MemBlockDevice, Stripe, Volumes};
pub use fxt_btree::{ItemStore, MemItemStore};
pub use fxt_btrfs::{
    BlockCheck, DropReport, DropStats, DropStatus, ExtentInfo, FileExtent, LeafItem, NodePtr,
    RootItem, TreeBlock,
};
pub use fxt_delayed_ref::{DelayedRef, RefAction, RefKind, RunStats};
pub use fxt_error::{FxtError, Result};
pub use fxt_extent::{Backref, CommittedRef, ExtentRecord, ExtentTarget, RefIdentity};
pub use fxt_types::{
    BLOCK_FLAG_FULL_BACKREF, BTRFS_SUPER_INFO_SIZE, BTRFS_SUPER_MIRROR_MAX, BlockGroupFlags,
    BtrfsKey, DeviceId, EXTENT_DATA_KEY, EXTENT_ITEM_KEY, ExtentOp, FS_TREE_OBJECTID, PhysRange,
    TxnId, super_mirror_offset,
};
