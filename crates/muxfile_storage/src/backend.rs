//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level storage backend for the muxfile engine.
///
/// Storage backends are **opaque byte stores** with random access. They
/// provide simple operations for reading, overwriting, appending, resizing,
/// and flushing data. The engine owns all file format interpretation -
/// backends do not understand headers, segments, or journal records.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` overwrites in place and never grows the store
/// - `append` returns the offset where data was written
/// - `set_len` grows with zero bytes or shrinks by discarding the tail
/// - `flush` pushes pending writes to the operating system
/// - `sync` makes data and metadata durable
/// - Backends must be `Send + Sync` for shared handle types
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The offset is beyond the current size
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Overwrites `data` in place starting at `offset`.
    ///
    /// The entire range `[offset, offset + data.len())` must lie within the
    /// current size; a write never grows the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends beyond the current size or an
    /// I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Resizes the storage to `new_size` bytes.
    ///
    /// Growing fills the new tail with zero bytes; shrinking discards data
    /// after the new size.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize operation fails.
    fn set_len(&mut self, new_size: u64) -> StorageResult<()>;

    /// Flushes all pending writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// This is a stronger guarantee than `flush` - it ensures that file
    /// metadata (size, timestamps) is also durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;
}
