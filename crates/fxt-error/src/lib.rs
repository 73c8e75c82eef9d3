#![forbid(unsafe_code)]
//! Error types for FrankenExtent.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `fxt-types` | Extent item / backref bytes that do not decode |
//! | Runtime | `FxtError` | `fxt-error` (this crate) | Errors returned by every engine entry point |
//!
//! `fxt-error` does not depend on `fxt-types`. Extent-item codecs convert a
//! `ParseError` into `FxtError::Corruption` with the bytenr being decoded,
//! since a malformed item in a live extent tree is corruption, not a format
//! mismatch.
//!
//! ## Transaction policy
//!
//! | Variant | errno | Aborts the transaction? |
//! |---------|-------|-------------------------|
//! | `Io` | `EIO` (or raw os error) | yes; the filesystem stays healthy |
//! | `Corruption` | `EIO` | always; the filesystem is also marked sick and read-only |
//! | `Format` / `Parse` | `EINVAL` | no |
//! | `UnsupportedFeature` | `EOPNOTSUPP` | no |
//! | `InvalidGeometry` | `EINVAL` | no |
//! | `InvalidArgument` | `EINVAL` | no |
//! | `OutOfMemory` | `ENOMEM` | no |
//! | `NoSpace` | `ENOSPC` | no; carries the largest free extent seen |
//! | `NotFound` | `ENOENT` | no |
//! | `Exists` | `EEXIST` | no |
//! | `Busy` | `EBUSY` | no; caller waits and restarts |
//! | `Again` | `EAGAIN` | no; caller retries |
//! | `Aborted` | `EROFS` | already aborted |
//! | `ReadOnly` | `EROFS` | no |
//! | `Cancelled` | `EINTR` | no |
//!
//! The errno mapping is exhaustive (no wildcard arms) so adding a variant is a
//! compile error until its errno is assigned.

use thiserror::Error;

/// Unified error type for all FrankenExtent operations.
#[derive(Debug, Error)]
pub enum FxtError {
    /// Operating system or device I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Extent tree invariant violated at a known bytenr.
    ///
    /// Examples: `refs == 0` on an existing item, an unknown inline ref type,
    /// an inline ref overrunning its item, a refcount underflow.
    #[error("corrupt extent metadata at bytenr {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid input that is not live metadata.
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without bytenr context.
    #[error("parse error: {0}")]
    Parse(String),

    /// The request needs a feature this build does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Mount geometry (sector size, node size, chunk sizes) out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Caller passed an argument that can never succeed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bookkeeping allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// No contiguous free range large enough.
    ///
    /// `max_extent_size` is the largest contiguous free extent observed during
    /// the search, so the caller may retry with a smaller request.
    #[error("no space left on device (largest free extent {max_extent_size} bytes)")]
    NoSpace { max_extent_size: u64 },

    /// Extent item, back-reference, block group or device not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already present.
    #[error("already exists: {0}")]
    Exists(String),

    /// A delayed-ref head mutex was contended.
    #[error("resource busy")]
    Busy,

    /// Transient condition; the caller should retry the operation.
    #[error("try again")]
    Again,

    /// The running transaction was aborted with `errno`.
    #[error("transaction aborted (errno {errno})")]
    Aborted { errno: i32 },

    /// The filesystem is read-only (after an abort or corruption).
    #[error("read-only filesystem")]
    ReadOnly,

    /// Operation interrupted.
    #[error("operation cancelled")]
    Cancelled,
}

impl FxtError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `Corruption` → `EIO`: callers cannot act on the distinction.
    /// - `Aborted` → `EROFS`: every entry point after an abort behaves as if
    ///   the filesystem were read-only.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NoSpace { .. } => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::Busy => libc::EBUSY,
            Self::Again => libc::EAGAIN,
            Self::Aborted { .. } | Self::ReadOnly => libc::EROFS,
            Self::Cancelled => libc::EINTR,
        }
    }

    /// Errors that promote the running transaction to aborted.
    #[must_use]
    pub fn is_transaction_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::Io(_))
    }

    /// Shorthand for a corruption error.
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// Largest free extent hint carried by `NoSpace`.
    #[must_use]
    pub fn max_extent_size(&self) -> Option<u64> {
        match self {
            Self::NoSpace { max_extent_size } => Some(*max_extent_size),
            _ => None,
        }
    }
}

/// Result alias using `FxtError`.
pub type Result<T> = std::result::Result<T, FxtError>;
