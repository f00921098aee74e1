//! Master file: header layout and journaled access.
//!
//! The master file is the single backing file holding all streams. This
//! module owns its fixed header and wraps the raw backend so that every
//! overwrite inside a transaction is preceded by a before-image journal
//! record.
//!
//! ## Header Format
//!
//! ```text
//! | magic (4) | version (2) | block size (4) | stream-table first (8) |
//! | free-space first (8) | file length (8) |
//! ```
//!
//! All integers are little-endian. The two first-segment locations are
//! signed, with -1 meaning absent. The header occupies block 0; the rest of
//! the block is padding.

use crate::config::MIN_BLOCK_SIZE;
use crate::error::{EngineError, EngineResult};
use crate::journal::Journal;
use muxfile_storage::StorageBackend;

/// Magic bytes identifying a muxfile master file.
pub(crate) const MASTER_MAGIC: [u8; 4] = *b"MUXF";

/// Current master file format version.
pub(crate) const MASTER_VERSION: u16 = 1;

/// Size of the encoded master header in bytes.
pub(crate) const MASTER_HEADER_SIZE: usize = 34;

fn encode_location(loc: Option<u64>) -> i64 {
    match loc {
        Some(v) => v as i64,
        None => -1,
    }
}

fn decode_location(raw: i64) -> EngineResult<Option<u64>> {
    match raw {
        -1 => Ok(None),
        v if v >= 0 => Ok(Some(v as u64)),
        v => Err(EngineError::bad_format(format!(
            "negative segment location {v}"
        ))),
    }
}

/// The decoded master file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MasterHeader {
    /// Block size this file was created with.
    pub(crate) block_size: u32,
    /// Location of the stream table's first segment.
    pub(crate) table_first: Option<u64>,
    /// Location of the free-space stream's first segment.
    pub(crate) free_first: Option<u64>,
    /// Overall file length in bytes.
    pub(crate) file_length: u64,
}

impl MasterHeader {
    pub(crate) fn new(block_size: u32) -> Self {
        Self {
            block_size,
            table_first: None,
            free_first: None,
            file_length: 0,
        }
    }

    /// Encodes the header to its on-disk form.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MASTER_HEADER_SIZE);
        buf.extend_from_slice(&MASTER_MAGIC);
        buf.extend_from_slice(&MASTER_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&encode_location(self.table_first).to_le_bytes());
        buf.extend_from_slice(&encode_location(self.free_first).to_le_bytes());
        buf.extend_from_slice(&(self.file_length as i64).to_le_bytes());
        buf
    }

    /// Decodes and validates a header read from offset 0.
    pub(crate) fn decode(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() < MASTER_HEADER_SIZE {
            return Err(EngineError::bad_format("master header truncated"));
        }
        if bytes[0..4] != MASTER_MAGIC {
            return Err(EngineError::bad_format("bad magic bytes"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != MASTER_VERSION {
            return Err(EngineError::bad_format(format!(
                "unsupported format version {version}"
            )));
        }
        let block_size = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() {
            return Err(EngineError::bad_format(format!(
                "invalid block size {block_size}"
            )));
        }

        let read_i64 = |at: usize| -> i64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            i64::from_le_bytes(raw)
        };
        let table_first = decode_location(read_i64(10))?;
        let free_first = decode_location(read_i64(18))?;
        let file_length = read_i64(26);
        if file_length < block_size as i64 {
            return Err(EngineError::bad_format(format!(
                "file length {file_length} smaller than one block"
            )));
        }

        Ok(Self {
            block_size,
            table_first,
            free_first,
            file_length: file_length as u64,
        })
    }
}

/// State of the single flattened transaction.
#[derive(Debug, Clone, Copy)]
struct TxState {
    /// Nesting depth; only the outermost commit truncates the journal.
    depth: u32,
    /// Set once any rollback has run; the remaining scope can only unwind.
    aborted: bool,
}

/// Journaled random access to the master file.
///
/// All engine mutations go through [`MasterFile::write`] and
/// [`MasterFile::grow`], which capture undo records while a transaction is
/// active. Reads are direct.
pub(crate) struct MasterFile {
    backend: Box<dyn StorageBackend>,
    journal: Journal,
    block_size: u64,
    tx: Option<TxState>,
}

impl MasterFile {
    pub(crate) fn new(backend: Box<dyn StorageBackend>, journal: Journal, block_size: u64) -> Self {
        Self {
            backend,
            journal,
            block_size,
            tx: None,
        }
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Adopts the block size recorded in an existing file's header.
    pub(crate) fn set_block_size(&mut self, block_size: u64) {
        self.block_size = block_size;
    }

    pub(crate) fn len(&self) -> EngineResult<u64> {
        Ok(self.backend.size()?)
    }

    pub(crate) fn read(&self, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
        Ok(self.backend.read_at(offset, len)?)
    }

    /// Overwrites a region, journaling its previous content first when a
    /// transaction is active.
    pub(crate) fn write(&mut self, offset: u64, data: &[u8]) -> EngineResult<()> {
        if let Some(tx) = self.tx {
            if tx.aborted {
                return Err(EngineError::TransactionConflict);
            }
            let file_len = self.backend.size()?;
            if offset < file_len {
                let img_len = (file_len - offset).min(data.len() as u64) as usize;
                let before = self.backend.read_at(offset, img_len)?;
                self.journal.record_image(offset, &before)?;
            }
        }
        self.backend.write_at(offset, data)?;
        Ok(())
    }

    /// Extends the file to `new_len`, journaling the previous length first
    /// when a transaction is active.
    pub(crate) fn grow(&mut self, new_len: u64) -> EngineResult<()> {
        let old_len = self.backend.size()?;
        if new_len <= old_len {
            return Ok(());
        }
        if let Some(tx) = self.tx {
            if tx.aborted {
                return Err(EngineError::TransactionConflict);
            }
            self.journal.record_extend(old_len)?;
        }
        self.backend.set_len(new_len)?;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> EngineResult<()> {
        Ok(self.backend.flush()?)
    }

    pub(crate) fn sync(&mut self) -> EngineResult<()> {
        Ok(self.backend.sync()?)
    }

    pub(crate) fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    /// Starts a transaction, or deepens the active one.
    pub(crate) fn begin_tx(&mut self) -> EngineResult<()> {
        if let Some(tx) = self.tx.as_mut() {
            if tx.aborted {
                return Err(EngineError::TransactionConflict);
            }
            tx.depth += 1;
            return Ok(());
        }
        self.journal.begin()?;
        self.tx = Some(TxState {
            depth: 1,
            aborted: false,
        });
        Ok(())
    }

    /// Commits one transaction level.
    ///
    /// Only the outermost commit flushes the master file and truncates the
    /// journal. If the flush fails the whole transaction is rolled back and
    /// the failure is returned.
    ///
    /// # Errors
    ///
    /// Returns `TransactionConflict` if no transaction is active or a
    /// rollback already ran inside this transaction.
    pub(crate) fn commit_tx(&mut self, sync_on_commit: bool) -> EngineResult<()> {
        let Some(tx) = self.tx.as_mut() else {
            return Err(EngineError::TransactionConflict);
        };
        if tx.aborted {
            tx.depth -= 1;
            let finished = tx.depth == 0;
            if finished {
                self.tx = None;
            }
            return Err(EngineError::TransactionConflict);
        }
        if tx.depth > 1 {
            tx.depth -= 1;
            return Ok(());
        }

        match self.commit_io(sync_on_commit) {
            Ok(()) => {
                self.tx = None;
                Ok(())
            }
            Err(err) => {
                let _ = self.journal.replay(self.backend.as_mut());
                self.tx = None;
                Err(err)
            }
        }
    }

    fn commit_io(&mut self, sync_on_commit: bool) -> EngineResult<()> {
        self.backend.flush()?;
        if sync_on_commit {
            self.backend.sync()?;
        }
        // Truncating the journal is the commit point.
        self.journal.reset()
    }

    /// Rolls the active transaction back by replaying the journal.
    ///
    /// Any rollback aborts the whole flattened transaction; outer scopes
    /// observe `TransactionConflict` when they try to commit.
    pub(crate) fn rollback_tx(&mut self) -> EngineResult<()> {
        let Some(tx) = self.tx.as_mut() else {
            return Err(EngineError::TransactionConflict);
        };
        if tx.aborted {
            tx.depth -= 1;
            let finished = tx.depth == 0;
            if finished {
                self.tx = None;
            }
            return Ok(());
        }

        let result = self.journal.replay(self.backend.as_mut());
        if let Some(tx) = self.tx.as_mut() {
            tx.aborted = true;
            tx.depth -= 1;
            if tx.depth == 0 {
                self.tx = None;
            }
        }
        result
    }

    /// Replays a journal left behind by an interrupted process.
    ///
    /// Called on open before the header is read; afterwards the master file
    /// holds its last committed state.
    pub(crate) fn recover(&mut self) -> EngineResult<bool> {
        if self.journal.is_empty()? {
            self.journal.reset()?;
            return Ok(false);
        }
        self.journal.replay(self.backend.as_mut())?;
        Ok(true)
    }
}

impl std::fmt::Debug for MasterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterFile")
            .field("block_size", &self.block_size)
            .field("in_tx", &self.in_tx())
            .finish_non_exhaustive()
    }
}

/// Builds a master file over in-memory backends for unit tests.
#[cfg(test)]
pub(crate) fn memory_master(block_size: u64) -> MasterFile {
    use muxfile_storage::InMemoryBackend;
    MasterFile::new(
        Box::new(InMemoryBackend::new()),
        Journal::new(Box::new(InMemoryBackend::new())),
        block_size,
    )
}
