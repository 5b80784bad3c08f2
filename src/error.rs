//! Crate-wide error type.
//!
//! The reader surfaces six kinds of failure: corruption (malformed footer,
//! bad index entry, disallowed legacy blocks), checksum mismatches, unknown
//! names (comparator / merger / key schema), operations on a closed or
//! failed reader, I/O errors from the underlying [`Readable`], and
//! cancellation.
//!
//! [`Readable`]: crate::readable::Readable

use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SstError>;

/// Errors returned by table readers, writers, and iterators.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error.
    #[error("Serialization (encode) error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Deserialization error.
    #[error("Deserialization (decode) error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Data integrity failure — a block trailer did not match the computed
    /// checksum.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Structural corruption: malformed footer, wrong metaindex length,
    /// corrupt index entry, legacy block versions, bad block encoding.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The file names a comparator this configuration does not know.
    #[error("table {file_num}: unknown comparator {name:?}")]
    UnknownComparator {
        /// File number of the offending table.
        file_num: u64,
        /// The comparator name recorded in the file's properties.
        name: String,
    },

    /// The file names a merger this configuration does not know.
    #[error("table {file_num}: unknown merger {name:?}")]
    UnknownMerger {
        /// File number of the offending table.
        file_num: u64,
        /// The merger name recorded in the file's properties.
        name: String,
    },

    /// The file names a key schema this configuration does not know.
    /// The message enumerates every schema the configuration does know.
    #[error("table {file_num}: unknown key schema {name:?}; known key schemas: {known:?}")]
    UnknownKeySchema {
        /// File number of the offending table.
        file_num: u64,
        /// The key schema name recorded in the file's properties.
        name: String,
        /// Sorted names of the schemas registered in the reader options.
        known: Vec<String>,
    },

    /// Operation on a closed reader.
    #[error("reader is closed")]
    ReaderClosed,

    /// Replay of an error previously latched into the reader. Once a reader
    /// fails it stays failed; every subsequent operation returns this.
    #[error("reader failed: {0}")]
    Failed(String),

    /// The caller's cancellation flag was raised while a read was pending.
    #[error("read cancelled")]
    Cancelled,

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SstError {
    /// Whether this error renders the reader unusable. Transient errors
    /// (cancellation, lifecycle sentinels) are never latched.
    pub(crate) fn latchable(&self) -> bool {
        !matches!(
            self,
            SstError::Cancelled | SstError::ReaderClosed | SstError::Failed(_)
        )
    }
}
