//! Discriminated error taxonomy surfaced on VC completion events.
//!
//! Mirrors the way the teacher crate scopes an error enum per module (`WriterError<T>`,
//! `ReaderError<T>`) and then lets callers match on a small, closed set of variants rather than an
//! opaque `Box<dyn Error>`. `CacheError` is the one taxonomy that crosses the external interface
//! boundary (spec.md §6/§7); every module-internal error type converts into it.

use snafu::Snafu;

use crate::key::CacheKey;

/// Error surfaced to a caller of the cache processor API (spec.md §6), or stored on a VC's
/// completion event.
#[derive(Debug, Snafu, Clone, Copy, Eq, PartialEq)]
pub enum CacheError {
    /// Directory miss, or all probes in the bucket chain were exhausted without a tag match.
    #[snafu(display("no matching document in the cache"))]
    NoDoc,

    /// Write rejected: the aggregation queue could not admit more pending bytes, or eviction could
    /// not free a directory slot.
    #[snafu(display("no space available to complete the write"))]
    NoSpace,

    /// `open_write` refused because the maximum number of concurrent writers for the key was
    /// already reached.
    #[snafu(display("object is already open for writing"))]
    DocBusy,

    /// The underlying disk has exceeded its error threshold; all I/O against its volumes fails
    /// with this until the disk is taken back out of the bad state administratively.
    #[snafu(display("underlying disk is marked bad"))]
    BadDisk,

    /// The AIO layer returned fewer bytes than requested, or a nonzero I/O error.
    #[snafu(display("read I/O error"))]
    ReadError,

    /// Magic mismatch, future format version, or checksum mismatch.
    #[snafu(display("stored document is corrupt"))]
    CorruptData,

    /// The HTTP alternates vector had no alternate satisfying the request.
    #[snafu(display("no alternate satisfies the request"))]
    AltMiss,

    /// Directory collision detected; the caller should re-issue the operation. Handled internally
    /// by the VC and only surfaced once the retry budget is exhausted.
    #[snafu(display("directory collision, retry budget exhausted"))]
    ReadRetry,

    /// The VC was canceled (`do_io_close`) before the operation completed.
    #[snafu(display("operation canceled"))]
    Canceled,
}

impl CacheError {
    /// True for errors that should clear the offending directory entry per the propagation policy
    /// in spec.md §7, without marking the owning disk bad.
    #[must_use]
    pub fn clears_directory_entry(self) -> bool {
        matches!(self, CacheError::CorruptData | CacheError::ReadError)
    }
}

/// An error tied to the key that triggered it, used internally when propagating up through the
/// directory/volume layers before being downgraded to a bare [`CacheError`] at the VC boundary.
#[derive(Debug, Clone, Copy)]
pub struct KeyedCacheError {
    pub key: CacheKey,
    pub error: CacheError,
}

impl KeyedCacheError {
    #[must_use]
    pub fn new(key: CacheKey, error: CacheError) -> Self {
        Self { key, error }
    }
}
