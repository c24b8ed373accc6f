//! Crate-level error taxonomy (spec.md §7).
//!
//! A single `Snafu`-derived enum covers every failure mode surfaced by
//! [`crate::writer::DirWriter`] and [`crate::reader::DirReader`].

use std::io;

use snafu::Snafu;

/// Top-level error type returned by the public `DirWriter`/`DirReader` API.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A requested file-id was not present in any epoch, or the manifest
    /// itself could not be located.
    #[snafu(display("not found: {}", what))]
    NotFound { what: String },

    /// A checksum mismatch, manifest magic mismatch, or (under
    /// `paranoid_checks`) a sort-order violation.
    #[snafu(display("corruption: {}", reason))]
    Corruption { reason: String },

    /// A non-blocking writer could not make progress because all memtable
    /// slots are full.
    #[snafu(display("buffer full for partition {}", partition))]
    BufferFull { partition: u32 },

    /// An I/O failure from the underlying storage.
    #[snafu(display("I/O error: {}", source))]
    Io { source: io::Error },

    /// API misuse: writing after `Finish`, an epoch mismatch, or use of a
    /// closed sink.
    #[snafu(display("assertion failed: {}", reason))]
    AssertionFailed { reason: String },

    /// An option, or combination of options, unsupported by this backend.
    #[snafu(display("not supported: {}", reason))]
    NotSupported { reason: String },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }
}

/// Convenience alias for fallible operations in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
