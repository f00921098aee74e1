//! Error types for the muxfile engine.

use crate::types::StreamId;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in muxfile engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] muxfile_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The master file header or an on-disk structure is invalid.
    #[error("bad format: {message}")]
    BadFormat {
        /// Description of the format issue.
        message: String,
    },

    /// A segment header failed checksum validation.
    #[error("checksum mismatch at offset {location}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// File offset of the segment header.
        location: u64,
        /// Checksum stored in the header.
        expected: u32,
        /// Checksum computed from the header fields.
        actual: u32,
    },

    /// The stream cursor has been closed.
    #[error("stream is closed")]
    StreamClosed,

    /// The storage has been closed.
    #[error("storage is closed")]
    StorageClosed,

    /// Another process holds the master file.
    #[error("storage locked: another process has exclusive access")]
    StorageLocked,

    /// No stream with the given identifier exists.
    #[error("no such stream: {id}")]
    NoSuchStream {
        /// The identifier that was looked up.
        id: StreamId,
    },

    /// A stream with the given identifier already exists.
    #[error("duplicate stream: {id}")]
    DuplicateStream {
        /// The identifier that collided.
        id: StreamId,
    },

    /// Seek, read, or write parameters are inconsistent with the stream.
    #[error("out of bounds: {message}")]
    OutOfBounds {
        /// Description of the violated bound.
        message: String,
    },

    /// A rollback was encountered during commit, or the transaction state
    /// does not permit the requested operation.
    #[error("transaction conflict: the transaction was rolled back")]
    TransactionConflict,
}

impl EngineError {
    /// Creates a bad format error.
    pub fn bad_format(message: impl Into<String>) -> Self {
        Self::BadFormat {
            message: message.into(),
        }
    }

    /// Creates an out of bounds error.
    pub fn out_of_bounds(message: impl Into<String>) -> Self {
        Self::OutOfBounds {
            message: message.into(),
        }
    }
}
