#![forbid(unsafe_code)]
//! Error types for the direct I/O engine.
//!
//! # Error Taxonomy
//!
//! Direct I/O accumulates errors in the request control block instead of
//! raising them at the point of detection: by the time anything goes wrong,
//! the pipeline has usually pinned pages and submitted device requests that
//! must be unwound uniformly. The finalizer converts accumulated state into
//! exactly one of: a byte count, a queued notification, or one of these
//! errors.
//!
//! | Variant            | errno      | Meaning |
//! |--------------------|------------|---------|
//! | `Misaligned`       | `EINVAL`   | Offset, iovec address, or length not aligned to the effective block size. Detected before any allocation. |
//! | `OutOfMemory`      | `ENOMEM`   | Control-block or request allocation failed. |
//! | `PageFault`        | `EFAULT`   | User memory could not be pinned. |
//! | `Io`               | `EIO`*     | Device I/O failure (first one seen wins). |
//! | `BufferedFallback` | `ENOTBLK`  | Write hit an unmapped block inside EOF with hole-skipping on; retry through the buffered path. Not a true failure. |
//! | `Map`              | `EIO`      | The filesystem mapping callback failed. |
//!
//! \* `Io` preserves the raw OS errno when one is present.
//!
//! The mapping is exhaustive — adding a variant without assigning its errno
//! is a compile error.

use thiserror::Error;

/// Unified error type for direct I/O operations.
#[derive(Debug, Error)]
pub enum DioError {
    /// Offset or an iovec segment is not aligned to the effective block
    /// size (after relaxation to the device's logical block size).
    #[error("misaligned direct I/O request: {0}")]
    Misaligned(String),

    /// Allocation failure while setting up the request.
    #[error("out of memory")]
    OutOfMemory,

    /// User memory could not be pinned.
    #[error("page fault pinning user memory")]
    PageFault,

    /// Device I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Policy signal: the write cannot proceed directly and should be
    /// retried through the buffered path.
    #[error("unmapped write inside EOF: fall back to buffered I/O")]
    BufferedFallback,

    /// The filesystem block-mapping callback failed.
    #[error("block mapping failed: {0}")]
    Map(String),
}

impl DioError {
    /// Convert this error into a POSIX errno.
    ///
    /// Exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Misaligned(_) => libc::EINVAL,
            Self::OutOfMemory => libc::ENOMEM,
            Self::PageFault => libc::EFAULT,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BufferedFallback => libc::ENOTBLK,
            Self::Map(_) => libc::EIO,
        }
    }

    /// Whether this error tells the caller to retry through the buffered
    /// path rather than report a failure.
    #[must_use]
    pub fn is_buffered_fallback(&self) -> bool {
        matches!(self, Self::BufferedFallback)
    }
}

/// Result alias using `DioError`.
pub type Result<T> = std::result::Result<T, DioError>;
