#![forbid(unsafe_code)]
//! Extent items and back-references.
//!
//! Every allocated range has one extent item recording how many references
//! point at it, its flags and, inline, as many back-references as fit. The
//! rest are standalone records keyed beside the item. The invariant kept by
//! every mutation in this crate:
//!
//! ```text
//! item.refs == Σ inline ref counts + Σ standalone ref counts
//! ```
//!
//! [`ExtentStore`] applies reference mutations to an
//! [`ItemStore`](fxt_btree::ItemStore); the delayed-ref engine is its only
//! caller on the write path.

pub mod backref;
pub mod cross_ref;
pub mod item;
pub mod store;

pub use backref::{
    InlineLookup, InsertRoom, RefIdentity, StandaloneRef, has_keyed_refs,
    insert_standalone_backref, lookup_inline_backref, lookup_standalone_backref,
    remove_standalone_backref, standalone_backrefs,
};
pub use cross_ref::{CommittedRef, RootRef};
pub use item::{DataRef, ExtentItem, InlineRef, ParseResultExt, TreeBlockInfo, max_extent_item_size};
pub use store::{Backref, DropOutcome, ExtentRecord, ExtentStore, ExtentTarget, NewExtent};
