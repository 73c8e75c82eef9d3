#![forbid(unsafe_code)]
//! FrankenExtent public API facade.
//!
//! Re-exports the extent tree engine from `fxt-core` through a stable
//! external interface. Downstream consumers (the harness, embedders)
//! depend on this crate.

pub use fxt_core::*;
