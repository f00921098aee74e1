//! # Muxfile Storage
//!
//! Storage backend trait and implementations for the muxfile engine.
//!
//! This crate provides the lowest-level storage abstraction for muxfile.
//! Storage backends are **opaque byte stores** with random access - they do
//! not interpret the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, write, append, resize, flush)
//! - No knowledge of muxfile file formats, segments, or journals
//! - Must be `Send + Sync` for shared handle types
//! - The engine owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use muxfile_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.set_len(16).unwrap();
//! backend.write_at(4, b"hello world").unwrap();
//! let data = backend.read_at(4, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
