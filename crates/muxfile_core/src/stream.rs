//! Stream cursors: random-access views over one logical stream.

use crate::error::{EngineError, EngineResult};
use crate::storage::{
    set_stream_length, stream_read_at, stream_write_at, with_tx, EngineState, StorageInner,
};
use crate::types::StreamId;
use parking_lot::MutexGuard;
use std::sync::Arc;

/// Reference point for [`StorageStream::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// Seek to `offset` from the start of the stream.
    Begin,
    /// Seek to the current position plus `offset`.
    Current,
    /// Seek to the stream length **minus** `offset`.
    ///
    /// Note the subtraction: `seek(0, End)` lands on the end of the stream
    /// and positive offsets move backwards, unlike the addition most seek
    /// APIs perform.
    End,
}

/// A cursor-bearing random-access view over one logical stream.
///
/// Cursors are obtained from [`crate::Storage::create_stream`] and
/// [`crate::Storage::open_stream`]. Every operation fails with
/// `StreamClosed` once the cursor is closed, its stream is deleted, or the
/// owning storage is closed.
///
/// Writes and resizes run inside an implicit transaction unless the caller
/// already started one; a failed mutation leaves the file at its previous
/// state.
pub struct StorageStream {
    inner: Arc<StorageInner>,
    id: StreamId,
    serial: u64,
    position: i64,
    closed: bool,
}

impl StorageStream {
    pub(crate) fn new(inner: Arc<StorageInner>, id: StreamId, serial: u64) -> Self {
        Self {
            inner,
            id,
            serial,
            position: 0,
            closed: false,
        }
    }

    /// The identifier of the stream this cursor addresses.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The current cursor position.
    ///
    /// Seeks can produce a negative position; reads and writes reject it.
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, EngineState>> {
        if self.closed {
            return Err(EngineError::StreamClosed);
        }
        let state = self.inner.state.lock();
        if !state.cursors.contains_key(&self.serial) {
            return Err(EngineError::StreamClosed);
        }
        Ok(state)
    }

    fn record(state: &EngineState, id: StreamId) -> EngineResult<crate::stream_table::StreamRecord> {
        let stream = state.streams.get(&id).ok_or(EngineError::StreamClosed)?;
        Ok(state.table.slots[stream.slot])
    }

    /// The logical length of the stream in bytes.
    pub fn length(&self) -> EngineResult<u64> {
        let state = self.lock()?;
        Ok(Self::record(&state, self.id)?.length)
    }

    /// The length of the written prefix; bytes beyond it read as zero.
    pub fn initialized_length(&self) -> EngineResult<u64> {
        let state = self.lock()?;
        Ok(Self::record(&state, self.id)?.initialized)
    }

    /// The caller-owned tag stored with the stream.
    pub fn tag(&self) -> EngineResult<u32> {
        let state = self.lock()?;
        Ok(Self::record(&state, self.id)?.tag)
    }

    /// Moves the cursor and returns the new position.
    ///
    /// No bounds are enforced here; an out-of-range position is rejected by
    /// the read or write that tries to use it.
    pub fn seek(&mut self, offset: i64, origin: SeekOrigin) -> EngineResult<i64> {
        let length = {
            let state = self.lock()?;
            Self::record(&state, self.id)?.length as i64
        };
        self.position = match origin {
            SeekOrigin::Begin => offset,
            SeekOrigin::Current => self.position + offset,
            SeekOrigin::End => length - offset,
        };
        Ok(self.position)
    }

    /// Reads up to `buf.len()` bytes at the cursor, advancing it.
    ///
    /// Reads stop at the stream length; bytes past the initialized length
    /// are returned as zero. Returns the number of bytes read, which is
    /// zero at or past the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the cursor position is negative.
    pub fn read(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        let n = {
            let state = self.lock()?;
            if self.position < 0 {
                return Err(EngineError::out_of_bounds(format!(
                    "read at negative position {}",
                    self.position
                )));
            }
            stream_read_at(&state, self.id, self.position as u64, buf)?
        };
        self.position += n as i64;
        Ok(n)
    }

    /// Writes all of `buf` at the cursor, advancing it.
    ///
    /// The stream grows as needed. Writing past the initialized length
    /// first fills the gap with zeros. Runs inside an implicit transaction;
    /// on failure the transaction is rolled back and the error re-raised.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` if the cursor position is negative.
    pub fn write(&mut self, buf: &[u8]) -> EngineResult<()> {
        if buf.is_empty() {
            // An empty write moves nothing and must not grow the stream.
            self.lock()?;
            return Ok(());
        }
        {
            let mut state = self.lock()?;
            if self.position < 0 {
                return Err(EngineError::out_of_bounds(format!(
                    "write at negative position {}",
                    self.position
                )));
            }
            let position = self.position as u64;
            let id = self.id;
            with_tx(&mut state, |state| stream_write_at(state, id, position, buf))?;
        }
        self.position += buf.len() as i64;
        Ok(())
    }

    /// Resizes the stream.
    ///
    /// Growing allocates from free space; shrinking returns segments to
    /// it; zero releases the whole chain. The cursor position is left
    /// untouched. Runs inside an implicit transaction.
    pub fn set_length(&mut self, value: u64) -> EngineResult<()> {
        let mut state = self.lock()?;
        let id = self.id;
        with_tx(&mut state, |state| set_stream_length(state, id, value))
    }

    /// Persists the stream's headers and metadata, then closes the cursor.
    ///
    /// A second close returns `StreamClosed`.
    pub fn close(&mut self) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::StreamClosed);
        }
        let mut state = self.inner.state.lock();
        if !state.cursors.contains_key(&self.serial) {
            self.closed = true;
            return Err(EngineError::StreamClosed);
        }

        let id = self.id;
        with_tx(&mut state, |state| {
            if let Some(stream) = state.streams.get_mut(&id) {
                stream.chain.rebuild(&mut state.master)?;
                let slot = stream.slot;
                let record = state.table.slots[slot];
                state.table.write_slot(&mut state.master, slot, record)?;
            }
            Ok(())
        })?;

        state.cursors.remove(&self.serial);
        Self::release_registration(&mut state, id);
        self.closed = true;
        Ok(())
    }

    fn release_registration(state: &mut EngineState, id: StreamId) {
        let evict = if let Some(stream) = state.streams.get_mut(&id) {
            stream.open_cursors = stream.open_cursors.saturating_sub(1);
            stream.open_cursors == 0
        } else {
            false
        };
        if evict {
            state.streams.remove(&id);
        }
    }
}

impl Drop for StorageStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Mutations persist eagerly, so dropping only releases the
        // registration; no I/O happens here.
        let mut state = self.inner.state.lock();
        if state.cursors.remove(&self.serial).is_some() {
            Self::release_registration(&mut state, self.id);
        }
    }
}

impl std::fmt::Debug for StorageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageStream")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}
