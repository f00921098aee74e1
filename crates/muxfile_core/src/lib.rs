//! # Muxfile Core
//!
//! A segmented transactional storage engine: one backing file multiplexing
//! many independently addressable byte streams.
//!
//! This crate provides:
//! - A master file of block-aligned, checksummed, chained segments
//! - A free-space stream reusing freed segments in place
//! - A stream table mapping 128-bit identifiers to stream metadata
//! - Cursor-based read/write/seek/resize over logical streams
//! - A single-writer transaction with before-image rollback
//!
//! ## Example
//!
//! ```rust
//! use muxfile_core::{SeekOrigin, Storage, StreamId};
//!
//! let storage = Storage::open_in_memory().unwrap();
//! let id = StreamId::new();
//!
//! let mut stream = storage.create_stream(id, 7).unwrap();
//! stream.write(b"hello muxfile").unwrap();
//! stream.seek(0, SeekOrigin::Begin).unwrap();
//!
//! let mut buf = [0u8; 13];
//! stream.read(&mut buf).unwrap();
//! assert_eq!(&buf, b"hello muxfile");
//! ```
//!
//! ## Concurrency Model
//!
//! The engine is single-threaded cooperative: it assumes exclusive access
//! to its backing file for the lifetime of a [`Storage`], every operation
//! blocks until the underlying I/O returns, and there is exactly one
//! writer. Handles are still `Send + Sync`; all operations serialize on
//! one internal lock.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod chain;
mod config;
mod error;
mod journal;
mod master;
mod segment;
mod storage;
mod stream;
mod stream_table;
mod types;

pub use config::{Config, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use error::{EngineError, EngineResult};
pub use segment::{compute_crc32, SEGMENT_HEADER_SIZE};
pub use storage::{Storage, StorageStats, Transaction};
pub use stream::{SeekOrigin, StorageStream};
pub use types::StreamId;
