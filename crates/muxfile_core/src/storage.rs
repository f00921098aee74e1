//! Storage coordinator.
//!
//! [`Storage`] opens the master file, owns the free-space stream and the
//! stream table, brokers stream creation and deletion, and runs the single
//! flattened transaction. Open stream cursors share the engine through a
//! registry keyed by cursor serial; a cursor whose registration is gone
//! observes `StreamClosed` and nothing else.

use crate::chain::SegmentChain;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::journal::Journal;
use crate::master::{MasterFile, MasterHeader, MASTER_HEADER_SIZE};
use crate::segment::{Segment, SEGMENT_HEADER_SIZE};
use crate::stream::StorageStream;
use crate::stream_table::{StreamRecord, StreamTable};
use crate::types::StreamId;
use muxfile_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Zero buffer used to fill uninitialized gaps in chunks.
const ZERO_CHUNK: [u8; 8192] = [0u8; 8192];

/// A loaded user stream: its slot, its chain, and how many cursors hold it.
pub(crate) struct StreamState {
    pub(crate) slot: usize,
    pub(crate) chain: SegmentChain,
    pub(crate) open_cursors: u32,
}

/// All mutable engine state, behind the coordinator's single lock.
pub(crate) struct EngineState {
    pub(crate) master: MasterFile,
    pub(crate) header: MasterHeader,
    pub(crate) free: SegmentChain,
    pub(crate) table: StreamTable,
    pub(crate) streams: HashMap<StreamId, StreamState>,
    pub(crate) cursors: HashMap<u64, StreamId>,
    pub(crate) next_cursor: u64,
    pub(crate) sync_on_commit: bool,
    pub(crate) closed: bool,
}

/// Shared core of a [`Storage`] and its stream cursors.
pub(crate) struct StorageInner {
    pub(crate) state: Mutex<EngineState>,
}

/// Point-in-time figures about a storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    /// Block size the file was created with.
    pub block_size: u32,
    /// Overall master file length in bytes.
    pub file_length: u64,
    /// Reusable data-area bytes held by the free-space stream.
    pub free_bytes: u64,
    /// Number of live user streams.
    pub stream_count: usize,
}

/// The main storage handle.
///
/// `Storage` is the entry point of the muxfile engine: a single-file
/// container multiplexing many independently addressable byte streams,
/// with crash-consistent mutation semantics and in-place reuse of freed
/// space.
///
/// # Opening a Storage File
///
/// ```rust,ignore
/// use muxfile_core::{Storage, StreamId};
/// use std::path::Path;
///
/// let storage = Storage::open(Path::new("manifests.mux"))?;
/// let id = StreamId::new();
/// let mut stream = storage.create_stream(id, 7)?;
/// stream.write(b"payload")?;
/// stream.close()?;
/// storage.close()?;
/// ```
///
/// # Concurrency
///
/// The engine is single-writer and assumes exclusive access to its backing
/// file for the lifetime of the handle; [`Storage::open`] takes an advisory
/// lock to enforce this across processes. The handle itself is `Send` and
/// `Sync`, with all operations serialized on one internal lock.
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Opens or creates a storage file with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process has the file locked (`StorageLocked`)
    /// - The file is not a muxfile container (`BadFormat`)
    /// - A structure fails checksum validation (`ChecksumMismatch`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> EngineResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens or creates a storage file with a custom configuration.
    ///
    /// The journal is kept in a side file named after the master file with
    /// a `.journal` suffix. If the journal holds records from an
    /// interrupted transaction, that transaction is rolled back before the
    /// header is read.
    pub fn open_with_config(path: &Path, config: Config) -> EngineResult<Self> {
        config.validate()?;

        if !config.create_if_missing && !path.exists() {
            return Err(EngineError::bad_format(format!(
                "storage file does not exist: {}",
                path.display()
            )));
        }

        let backend = FileBackend::open(path)?;
        if !backend.try_lock_exclusive()? {
            return Err(EngineError::StorageLocked);
        }

        let mut journal_name = path.as_os_str().to_os_string();
        journal_name.push(".journal");
        let journal_backend = FileBackend::open(Path::new(&journal_name))?;

        debug!(path = %path.display(), "opening storage");
        Self::open_with_backends(config, Box::new(backend), Box::new(journal_backend))
    }

    /// Opens a storage over pre-configured backends.
    ///
    /// This is a lower-level constructor; it performs no file locking. For
    /// most use cases prefer [`Storage::open`].
    pub fn open_with_backends(
        config: Config,
        master_backend: Box<dyn StorageBackend>,
        journal_backend: Box<dyn StorageBackend>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let journal = Journal::new(journal_backend);
        let mut master = MasterFile::new(master_backend, journal, config.block_size as u64);

        let header = if master.len()? == 0 {
            bootstrap(&mut master, config.block_size)?
        } else {
            if master.recover()? {
                debug!("rolled back an interrupted transaction from the journal");
            }
            if master.len()? < MASTER_HEADER_SIZE as u64 {
                return Err(EngineError::bad_format("master file smaller than its header"));
            }
            let header = MasterHeader::decode(&master.read(0, MASTER_HEADER_SIZE)?)?;
            master.set_block_size(header.block_size as u64);
            if header.file_length != master.len()? {
                return Err(EngineError::bad_format(format!(
                    "header records file length {}, file is {} bytes",
                    header.file_length,
                    master.len()?
                )));
            }
            header
        };

        let free = SegmentChain::load(&master, header.free_first)?;
        let table = StreamTable::load(&master, header.table_first)?;

        Ok(Self {
            inner: Arc::new(StorageInner {
                state: Mutex::new(EngineState {
                    master,
                    header,
                    free,
                    table,
                    streams: HashMap::new(),
                    cursors: HashMap::new(),
                    next_cursor: 1,
                    sync_on_commit: config.sync_on_commit,
                    closed: false,
                }),
            }),
        })
    }

    /// Opens a fresh in-memory storage for testing.
    ///
    /// Data is lost when the handle is dropped.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::open_with_backends(
            Config::default(),
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
        )
    }

    fn lock_open(&self) -> EngineResult<MutexGuard<'_, EngineState>> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(EngineError::StorageClosed);
        }
        Ok(state)
    }

    /// Creates a new empty stream and returns a cursor over it.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateStream` if `id` already exists or is one of the
    /// reserved system identifiers.
    pub fn create_stream(&self, id: StreamId, tag: u32) -> EngineResult<StorageStream> {
        let mut state = self.lock_open()?;
        if id.is_reserved() || state.table.find(id).is_some() {
            return Err(EngineError::DuplicateStream { id });
        }

        let slot = with_tx(&mut state, |state| {
            let slot = match state.table.find_vacant() {
                Some(slot) => slot,
                None => {
                    grow_table(state)?;
                    state.table.find_vacant().ok_or_else(|| {
                        EngineError::bad_format("stream table grow produced no vacant slot")
                    })?
                }
            };
            let record = StreamRecord {
                id,
                tag,
                first_segment: None,
                length: 0,
                initialized: 0,
            };
            state.table.write_slot(&mut state.master, slot, record)?;
            sync_header(state)?;
            Ok(slot)
        })?;

        state.streams.insert(
            id,
            StreamState {
                slot,
                chain: SegmentChain::empty(),
                open_cursors: 1,
            },
        );
        let serial = state.next_cursor;
        state.next_cursor += 1;
        state.cursors.insert(serial, id);

        debug!(%id, tag, "created stream");
        Ok(StorageStream::new(Arc::clone(&self.inner), id, serial))
    }

    /// Opens an existing stream and returns a cursor positioned at zero.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchStream` if `id` does not name a live user stream.
    pub fn open_stream(&self, id: StreamId) -> EngineResult<StorageStream> {
        let mut state = self.lock_open()?;
        if id.is_reserved() {
            return Err(EngineError::NoSuchStream { id });
        }
        let Some(slot) = state.table.find(id) else {
            return Err(EngineError::NoSuchStream { id });
        };

        if !state.streams.contains_key(&id) {
            let chain = SegmentChain::load(&state.master, state.table.slots[slot].first_segment)?;
            state.streams.insert(
                id,
                StreamState {
                    slot,
                    chain,
                    open_cursors: 0,
                },
            );
        }
        if let Some(stream) = state.streams.get_mut(&id) {
            stream.slot = slot;
            stream.open_cursors += 1;
        }

        let serial = state.next_cursor;
        state.next_cursor += 1;
        state.cursors.insert(serial, id);
        Ok(StorageStream::new(Arc::clone(&self.inner), id, serial))
    }

    /// Deletes a stream, returning all its segments to free space.
    ///
    /// Open cursors over the stream observe `StreamClosed` afterwards.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchStream` if `id` does not name a live user stream.
    pub fn delete_stream(&self, id: StreamId) -> EngineResult<()> {
        let mut state = self.lock_open()?;
        if id.is_reserved() {
            return Err(EngineError::NoSuchStream { id });
        }
        let Some(slot) = state.table.find(id) else {
            return Err(EngineError::NoSuchStream { id });
        };

        with_tx(&mut state, |state| {
            let mut chain = match state.streams.get_mut(&id) {
                Some(stream) => std::mem::replace(&mut stream.chain, SegmentChain::empty()),
                None => SegmentChain::load(&state.master, state.table.slots[slot].first_segment)?,
            };
            let segments = chain.clear_into();
            release_segments(state, segments)?;
            state.table.clear_slot(&mut state.master, slot)?;
            sync_header(state)
        })?;

        state.streams.remove(&id);
        state.cursors.retain(|_, stream_id| *stream_id != id);
        debug!(%id, "deleted stream");
        Ok(())
    }

    /// Returns whether a live stream with this identifier exists.
    pub fn contains_stream(&self, id: StreamId) -> EngineResult<bool> {
        let state = self.lock_open()?;
        Ok(!id.is_reserved() && state.table.find(id).is_some())
    }

    /// Identifiers of all live streams.
    pub fn stream_ids(&self) -> EngineResult<Vec<StreamId>> {
        let state = self.lock_open()?;
        Ok(state.table.live_ids())
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> EngineResult<usize> {
        let state = self.lock_open()?;
        Ok(state.table.live_count())
    }

    /// Point-in-time statistics about the storage file.
    pub fn stats(&self) -> EngineResult<StorageStats> {
        let state = self.lock_open()?;
        Ok(StorageStats {
            block_size: state.header.block_size,
            file_length: state.header.file_length,
            free_bytes: state.free.total_data_size(),
            stream_count: state.table.live_count(),
        })
    }

    /// Starts an explicit transaction.
    ///
    /// Transactions flatten: starting another while one is active deepens
    /// it, and only the outermost commit makes the changes durable. The
    /// returned guard rolls the whole transaction back when dropped without
    /// [`Transaction::commit`].
    pub fn begin_transaction(&self) -> EngineResult<Transaction> {
        let mut state = self.lock_open()?;
        begin_tx(&mut state)?;
        Ok(Transaction {
            inner: Arc::clone(&self.inner),
            finished: false,
        })
    }

    /// Runs `f` inside a transaction, committing on `Ok` and rolling back
    /// on `Err`.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> EngineResult<T>) -> EngineResult<T> {
        let tx = self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback();
                Err(err)
            }
        }
    }

    /// Walks the whole file and checks its structural invariants.
    ///
    /// Verifies that live segments tile `[block_size, file_length)` exactly
    /// with no overlap, that sizes and locations are block-aligned, that
    /// every header passes its checksum, that the free chain is ordered by
    /// location, and that every stream's lengths are consistent with its
    /// chain.
    ///
    /// # Errors
    ///
    /// Returns `BadFormat` or `ChecksumMismatch` describing the first
    /// violation found.
    pub fn verify_integrity(&self) -> EngineResult<()> {
        let state = self.lock_open()?;
        let master = &state.master;
        let block = master.block_size();
        let file_len = master.len()?;

        let header = MasterHeader::decode(&master.read(0, MASTER_HEADER_SIZE)?)?;
        if header.file_length != file_len {
            return Err(EngineError::bad_format(format!(
                "header records file length {}, file is {file_len} bytes",
                header.file_length
            )));
        }

        let free = SegmentChain::load(master, header.free_first)?;
        let table = StreamTable::load(master, header.table_first)?;

        for pair in free.segments().windows(2) {
            if pair[0].location() >= pair[1].location() {
                return Err(EngineError::bad_format(format!(
                    "free chain out of order at offset {}",
                    pair[1].location()
                )));
            }
        }

        let mut extents: Vec<(u64, u64)> = Vec::new();
        for segment in free.segments().iter().chain(table.chain.segments()) {
            extents.push((segment.location(), segment.size()));
        }
        for record in &table.slots {
            if record.is_vacant() {
                continue;
            }
            let chain = SegmentChain::load(master, record.first_segment)?;
            if record.first_segment.is_none() != (record.length == 0) {
                return Err(EngineError::bad_format(format!(
                    "stream {} has length {} but first segment {:?}",
                    record.id, record.length, record.first_segment
                )));
            }
            if record.length > chain.total_data_size() {
                return Err(EngineError::bad_format(format!(
                    "stream {} length {} exceeds chain capacity {}",
                    record.id,
                    record.length,
                    chain.total_data_size()
                )));
            }
            for segment in chain.segments() {
                extents.push((segment.location(), segment.size()));
            }
        }

        for &(location, size) in &extents {
            if location % block != 0 || size % block != 0 || size < block {
                return Err(EngineError::bad_format(format!(
                    "segment at {location} with size {size} violates block alignment"
                )));
            }
        }

        extents.sort_unstable();
        let mut expected = block;
        for &(location, size) in &extents {
            if location != expected {
                return Err(EngineError::bad_format(format!(
                    "coverage violation: expected a segment at offset {expected}, found {location}"
                )));
            }
            expected = location + size;
        }
        if expected != file_len {
            return Err(EngineError::bad_format(format!(
                "coverage violation: segments end at {expected}, file ends at {file_len}"
            )));
        }

        Ok(())
    }

    /// Persists all state, closes registered stream cursors, and releases
    /// the file.
    ///
    /// An in-progress transaction is rolled back first. Closing twice
    /// returns `StorageClosed`.
    pub fn close(&self) -> EngineResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(EngineError::StorageClosed);
        }
        close_state(&mut state)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if !state.closed {
            let _ = close_state(&mut state);
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

/// An explicit transaction scope.
///
/// Dropping the guard without committing rolls the whole transaction back.
#[must_use = "dropping a transaction rolls it back"]
pub struct Transaction {
    inner: Arc<StorageInner>,
    finished: bool,
}

impl Transaction {
    /// Commits this transaction level.
    ///
    /// # Errors
    ///
    /// Returns `TransactionConflict` if a rollback already ran inside the
    /// flattened transaction; the storage is then back at its
    /// pre-transaction state.
    pub fn commit(mut self) -> EngineResult<()> {
        self.finished = true;
        let mut state = self.inner.state.lock();
        commit_tx(&mut state)
    }

    /// Rolls the whole transaction back.
    pub fn rollback(mut self) -> EngineResult<()> {
        self.finished = true;
        let mut state = self.inner.state.lock();
        rollback_tx(&mut state)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.inner.state.lock();
            let _ = rollback_tx(&mut state);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("finished", &self.finished)
            .finish()
    }
}

/// Writes the initial header block and stream-table block of a new file.
///
/// Bootstrap happens outside any transaction; a crash here leaves a file
/// the next open rejects, which the caller may delete and recreate.
fn bootstrap(master: &mut MasterFile, block_size: u32) -> EngineResult<MasterHeader> {
    let block = u64::from(block_size);
    master.grow(block * 2)?;

    let mut table_segment = Segment::create(block, block);
    table_segment.persist(master)?;

    let mut header = MasterHeader::new(block_size);
    header.table_first = Some(block);
    header.file_length = block * 2;
    master.write(0, &header.encode())?;

    master.flush()?;
    master.sync()?;
    debug!(block_size, "created new storage file");
    Ok(header)
}

pub(crate) fn begin_tx(state: &mut EngineState) -> EngineResult<()> {
    state.master.begin_tx()
}

pub(crate) fn commit_tx(state: &mut EngineState) -> EngineResult<()> {
    let sync = state.sync_on_commit;
    match state.master.commit_tx(sync) {
        Ok(()) => Ok(()),
        Err(err) => {
            // The master file was already rolled back on disk; bring the
            // in-memory image back in line with it.
            let _ = reload_state(state);
            Err(err)
        }
    }
}

pub(crate) fn rollback_tx(state: &mut EngineState) -> EngineResult<()> {
    let result = state.master.rollback_tx();
    if result.is_ok() {
        debug!("transaction rolled back");
    }
    let reload = reload_state(state);
    result.and(reload)
}

/// Runs `f` inside an implicit transaction level.
pub(crate) fn with_tx<T>(
    state: &mut EngineState,
    f: impl FnOnce(&mut EngineState) -> EngineResult<T>,
) -> EngineResult<T> {
    begin_tx(state)?;
    match f(state) {
        Ok(value) => {
            commit_tx(state)?;
            Ok(value)
        }
        Err(err) => {
            let _ = rollback_tx(state);
            Err(err)
        }
    }
}

/// Rebuilds the in-memory image from disk after a rollback.
///
/// Loaded streams are refreshed from the reloaded table; streams that no
/// longer exist lose their registration, so their cursors observe
/// `StreamClosed`.
pub(crate) fn reload_state(state: &mut EngineState) -> EngineResult<()> {
    state.header = MasterHeader::decode(&state.master.read(0, MASTER_HEADER_SIZE)?)?;
    state.master.set_block_size(u64::from(state.header.block_size));
    state.free = SegmentChain::load(&state.master, state.header.free_first)?;
    state.table = StreamTable::load(&state.master, state.header.table_first)?;

    let ids: Vec<StreamId> = state.streams.keys().copied().collect();
    for id in ids {
        match state.table.find(id) {
            Some(slot) => {
                let chain =
                    SegmentChain::load(&state.master, state.table.slots[slot].first_segment)?;
                if let Some(stream) = state.streams.get_mut(&id) {
                    stream.slot = slot;
                    stream.chain = chain;
                }
            }
            None => {
                state.streams.remove(&id);
                state.cursors.retain(|_, stream_id| *stream_id != id);
            }
        }
    }
    Ok(())
}

/// Rewrites the master header with the current chain heads.
pub(crate) fn sync_header(state: &mut EngineState) -> EngineResult<()> {
    state.header.free_first = state.free.first_location();
    state.header.table_first = state.table.chain.first_location();
    let bytes = state.header.encode();
    state.master.write(0, &bytes)
}

/// Removes `amount` data-area bytes from free space, extending the master
/// file when the free chain runs dry.
pub(crate) fn allocate_space(state: &mut EngineState, amount: u64) -> EngineResult<Vec<Segment>> {
    let block = state.master.block_size();
    let mut taken = Vec::new();
    let mut remaining = amount;

    loop {
        let (mut got, unmet) = state.free.take_front(&state.master, remaining)?;
        taken.append(&mut got);
        remaining = unmet;
        if remaining == 0 {
            break;
        }

        // Free space is exhausted: extend the file at its tail by a rounded
        // number of blocks, hand the new tail to free space, and retry.
        let grow_by = (remaining + SEGMENT_HEADER_SIZE).div_ceil(block) * block;
        let old_len = state.header.file_length;
        debug!(bytes = grow_by, "extending master file");
        state.master.grow(old_len + grow_by)?;
        state.header.file_length = old_len + grow_by;
        state.free.insert_sorted(vec![Segment::create(old_len, grow_by)]);
    }

    state.free.rebuild(&mut state.master)?;
    sync_header(state)?;
    Ok(taken)
}

/// Returns segments to the free-space stream, coalescing adjacent ones.
pub(crate) fn release_segments(
    state: &mut EngineState,
    segments: Vec<Segment>,
) -> EngineResult<()> {
    if segments.is_empty() {
        return Ok(());
    }
    state.free.insert_sorted(segments);
    state.free.rebuild(&mut state.master)
}

/// Grows the stream table by one block's worth of free space.
fn grow_table(state: &mut EngineState) -> EngineResult<()> {
    let old_capacity = state.table.capacity();
    let amount = state.master.block_size();
    let segments = allocate_space(state, amount)?;
    state.table.chain.append(segments);
    state.table.chain.rebuild(&mut state.master)?;
    state.table.extend_slots(&mut state.master, old_capacity)?;
    sync_header(state)
}

/// Resizes a loaded stream. Assumes a transaction is active.
pub(crate) fn set_stream_length(
    state: &mut EngineState,
    id: StreamId,
    value: u64,
) -> EngineResult<()> {
    let slot = state
        .streams
        .get(&id)
        .ok_or(EngineError::StreamClosed)?
        .slot;
    let mut record = state.table.slots[slot];
    let current = record.length;

    if value > current {
        let capacity = state
            .streams
            .get(&id)
            .map(|s| s.chain.total_data_size())
            .unwrap_or(0);
        let needed = value.saturating_sub(capacity);
        if needed > 0 {
            let segments = allocate_space(state, needed)?;
            let stream = state.streams.get_mut(&id).ok_or(EngineError::StreamClosed)?;
            stream.chain.append(segments);
            stream.chain.rebuild(&mut state.master)?;
        }
        record.length = value;
    } else if value == 0 {
        let stream = state.streams.get_mut(&id).ok_or(EngineError::StreamClosed)?;
        let mut chain = std::mem::replace(&mut stream.chain, SegmentChain::empty());
        let segments = chain.clear_into();
        release_segments(state, segments)?;
        record.length = 0;
        record.initialized = 0;
    } else if value < current {
        let stream = state.streams.get_mut(&id).ok_or(EngineError::StreamClosed)?;
        let freed = stream.chain.take_back(&state.master, current - value)?;
        stream.chain.rebuild(&mut state.master)?;
        release_segments(state, freed)?;
        record.length = value;
        record.initialized = record.initialized.min(value);
    }

    record.first_segment = state
        .streams
        .get(&id)
        .and_then(|s| s.chain.first_location());
    state.table.write_slot(&mut state.master, slot, record)?;
    sync_header(state)
}

/// Reads from a loaded stream at an absolute position, zero-extending past
/// the initialized length. Returns the number of bytes produced.
pub(crate) fn stream_read_at(
    state: &EngineState,
    id: StreamId,
    position: u64,
    buf: &mut [u8],
) -> EngineResult<usize> {
    let stream = state.streams.get(&id).ok_or(EngineError::StreamClosed)?;
    let record = state.table.slots[stream.slot];

    if position >= record.length || buf.is_empty() {
        return Ok(0);
    }
    let n = (buf.len() as u64).min(record.length - position);
    let initialized_part = if position < record.initialized {
        n.min(record.initialized - position)
    } else {
        0
    };

    if initialized_part > 0 {
        let spans = stream.chain.spans(position, initialized_part)?;
        let mut at = 0usize;
        for (offset, len) in spans {
            let bytes = state.master.read(offset, len)?;
            buf[at..at + len].copy_from_slice(&bytes);
            at += len;
        }
    }
    for byte in &mut buf[initialized_part as usize..n as usize] {
        *byte = 0;
    }
    Ok(n as usize)
}

/// Writes into a loaded stream at an absolute position, growing it and
/// zero-filling any gap beyond the initialized length first. Assumes a
/// transaction is active.
pub(crate) fn stream_write_at(
    state: &mut EngineState,
    id: StreamId,
    position: u64,
    buf: &[u8],
) -> EngineResult<()> {
    let end = position + buf.len() as u64;
    let slot = state
        .streams
        .get(&id)
        .ok_or(EngineError::StreamClosed)?
        .slot;

    if end > state.table.slots[slot].length {
        set_stream_length(state, id, end)?;
    }

    let initialized = state.table.slots[slot].initialized;
    if position > initialized {
        write_zeros(state, id, initialized, position - initialized)?;
    }

    write_region(state, id, position, buf)?;

    let mut record = state.table.slots[slot];
    if end > record.initialized {
        record.initialized = end;
        state.table.write_slot(&mut state.master, slot, record)?;
    }
    Ok(())
}

fn write_region(
    state: &mut EngineState,
    id: StreamId,
    position: u64,
    buf: &[u8],
) -> EngineResult<()> {
    let spans = state
        .streams
        .get(&id)
        .ok_or(EngineError::StreamClosed)?
        .chain
        .spans(position, buf.len() as u64)?;
    let mut at = 0usize;
    for (offset, len) in spans {
        state.master.write(offset, &buf[at..at + len])?;
        at += len;
    }
    Ok(())
}

fn write_zeros(
    state: &mut EngineState,
    id: StreamId,
    position: u64,
    count: u64,
) -> EngineResult<()> {
    let spans = state
        .streams
        .get(&id)
        .ok_or(EngineError::StreamClosed)?
        .chain
        .spans(position, count)?;
    for (offset, len) in spans {
        let mut written = 0usize;
        while written < len {
            let chunk = (len - written).min(ZERO_CHUNK.len());
            state.master.write(offset + written as u64, &ZERO_CHUNK[..chunk])?;
            written += chunk;
        }
    }
    Ok(())
}

fn close_state(state: &mut EngineState) -> EngineResult<()> {
    if state.master.in_tx() {
        let _ = rollback_tx(state);
    }

    // Close registered streams before the file goes away.
    let result = with_tx(state, |state| {
        let ids: Vec<StreamId> = state.streams.keys().copied().collect();
        for id in ids {
            if let Some(stream) = state.streams.get_mut(&id) {
                stream.chain.rebuild(&mut state.master)?;
                let slot = stream.slot;
                let record = state.table.slots[slot];
                state.table.write_slot(&mut state.master, slot, record)?;
            }
        }
        sync_header(state)
    });

    state.streams.clear();
    state.cursors.clear();
    state.master.flush()?;
    state.master.sync()?;
    state.closed = true;
    debug!("storage closed");
    result
}
