//! Before-image transaction journal.
//!
//! The journal is an append-only undo log kept beside the master file.
//! Before any region of the master file is overwritten inside a
//! transaction, its current content is appended here; before the file is
//! extended, its current length is appended here. Rolling back replays the
//! records from tail to head, restoring every region and truncating the
//! file back to its pre-transaction length.
//!
//! ## Record Format
//!
//! ```text
//! | type (1) | param (8) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! For a before-image record, `param` is the master-file offset and the
//! payload is the overwritten bytes. For an extension record, `param` is
//! the file length before the extension and the payload is empty.
//!
//! ## Commit Point
//!
//! Truncating the journal is the commit point. A journal that still holds
//! records when the storage is opened belongs to a transaction that never
//! committed; it is replayed and discarded before the master file is read.
//!
//! ## Recovery Policy
//!
//! A truncated record at the tail is tolerated and discarded: the ordering
//! guarantee (journal write completes before the target write begins) means
//! its target region was never overwritten. A checksum mismatch on an
//! earlier record is fatal.

use crate::error::{EngineError, EngineResult};
use crate::segment::compute_crc32;
use muxfile_storage::StorageBackend;

/// Magic bytes identifying a journal file.
pub(crate) const JOURNAL_MAGIC: [u8; 4] = *b"MXJL";

/// Current journal format version.
pub(crate) const JOURNAL_VERSION: u16 = 1;

/// Size of the journal file header.
const JOURNAL_HEADER_SIZE: u64 = 6;

/// Fixed bytes per record besides the payload.
const RECORD_OVERHEAD: usize = 17;

/// A single undo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JournalRecord {
    /// The previous content of a master-file region about to be overwritten.
    Image {
        /// Absolute master-file offset of the region.
        offset: u64,
        /// The bytes the region held before the overwrite.
        bytes: Vec<u8>,
    },
    /// The master file is about to be extended past `old_len`.
    Extend {
        /// File length before the extension.
        old_len: u64,
    },
}

const RECORD_TYPE_IMAGE: u8 = 1;
const RECORD_TYPE_EXTEND: u8 = 2;

impl JournalRecord {
    fn encode(&self) -> Vec<u8> {
        let (tag, param, payload): (u8, u64, &[u8]) = match self {
            Self::Image { offset, bytes } => (RECORD_TYPE_IMAGE, *offset, bytes),
            Self::Extend { old_len } => (RECORD_TYPE_EXTEND, *old_len, &[]),
        };

        let mut buf = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
        buf.push(tag);
        buf.extend_from_slice(&param.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }
}

/// The before-image log backing transaction rollback.
pub(crate) struct Journal {
    backend: Box<dyn StorageBackend>,
}

impl Journal {
    pub(crate) fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Prepares the journal for a new transaction.
    pub(crate) fn begin(&mut self) -> EngineResult<()> {
        self.backend.set_len(0)?;
        let mut header = Vec::with_capacity(JOURNAL_HEADER_SIZE as usize);
        header.extend_from_slice(&JOURNAL_MAGIC);
        header.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        self.backend.append(&header)?;
        self.backend.flush()?;
        Ok(())
    }

    /// Discards all records. This is the commit point.
    pub(crate) fn reset(&mut self) -> EngineResult<()> {
        self.backend.set_len(0)?;
        self.backend.sync()?;
        Ok(())
    }

    /// Returns whether the journal holds any records.
    pub(crate) fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.backend.size()? <= JOURNAL_HEADER_SIZE)
    }

    /// Appends a before-image record and flushes it.
    ///
    /// The flush completes before this returns, so the caller may overwrite
    /// the imaged region afterwards.
    pub(crate) fn record_image(&mut self, offset: u64, bytes: &[u8]) -> EngineResult<()> {
        let record = JournalRecord::Image {
            offset,
            bytes: bytes.to_vec(),
        };
        self.backend.append(&record.encode())?;
        self.backend.flush()?;
        Ok(())
    }

    /// Appends an extension record and flushes it.
    pub(crate) fn record_extend(&mut self, old_len: u64) -> EngineResult<()> {
        let record = JournalRecord::Extend { old_len };
        self.backend.append(&record.encode())?;
        self.backend.flush()?;
        Ok(())
    }

    /// Reads all complete records in append order.
    ///
    /// A truncated record at the tail is discarded. A checksum mismatch is
    /// fatal.
    pub(crate) fn read_records(&self) -> EngineResult<Vec<JournalRecord>> {
        let size = self.backend.size()?;
        if size < JOURNAL_HEADER_SIZE {
            return Ok(Vec::new());
        }

        let header = self.backend.read_at(0, JOURNAL_HEADER_SIZE as usize)?;
        if header[0..4] != JOURNAL_MAGIC {
            // Torn begin: the header itself never completed, so no record
            // was written either.
            return Ok(Vec::new());
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != JOURNAL_VERSION {
            return Err(EngineError::bad_format(format!(
                "unsupported journal version {version}"
            )));
        }

        let mut records = Vec::new();
        let mut pos = JOURNAL_HEADER_SIZE;
        while pos < size {
            if size - pos < RECORD_OVERHEAD as u64 {
                break; // torn tail
            }
            let head = self.backend.read_at(pos, 13)?;
            let tag = head[0];
            let param = u64::from_le_bytes(
                head[1..9]
                    .try_into()
                    .map_err(|_| EngineError::bad_format("invalid journal record header"))?,
            );
            let payload_len = u32::from_le_bytes(
                head[9..13]
                    .try_into()
                    .map_err(|_| EngineError::bad_format("invalid journal record header"))?,
            ) as u64;
            if size - pos < RECORD_OVERHEAD as u64 + payload_len {
                break; // torn tail
            }

            let body = self.backend.read_at(pos, 13 + payload_len as usize)?;
            let crc_bytes = self.backend.read_at(pos + 13 + payload_len, 4)?;
            let expected = u32::from_le_bytes(
                crc_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| EngineError::bad_format("invalid journal record trailer"))?,
            );
            let actual = compute_crc32(&body);
            if expected != actual {
                return Err(EngineError::ChecksumMismatch {
                    location: pos,
                    expected,
                    actual,
                });
            }

            let record = match tag {
                RECORD_TYPE_IMAGE => JournalRecord::Image {
                    offset: param,
                    bytes: body[13..].to_vec(),
                },
                RECORD_TYPE_EXTEND => JournalRecord::Extend { old_len: param },
                other => {
                    return Err(EngineError::bad_format(format!(
                        "unknown journal record type {other}"
                    )))
                }
            };
            records.push(record);
            pos += RECORD_OVERHEAD as u64 + payload_len;
        }

        Ok(records)
    }

    /// Replays all records against `target` from tail to head, then
    /// discards them.
    ///
    /// After this returns the target holds its pre-transaction content.
    pub(crate) fn replay(&mut self, target: &mut dyn StorageBackend) -> EngineResult<()> {
        let records = self.read_records()?;
        for record in records.iter().rev() {
            match record {
                JournalRecord::Image { offset, bytes } => {
                    target.write_at(*offset, bytes)?;
                }
                JournalRecord::Extend { old_len } => {
                    target.set_len(*old_len)?;
                }
            }
        }
        target.sync()?;
        self.reset()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxfile_storage::InMemoryBackend;

    fn journal() -> Journal {
        Journal::new(Box::new(InMemoryBackend::new()))
    }

    #[test]
    fn begin_leaves_empty_journal() {
        let mut j = journal();
        j.begin().unwrap();
        assert!(j.is_empty().unwrap());
        assert!(j.read_records().unwrap().is_empty());
    }

    #[test]
    fn records_roundtrip_in_order() {
        let mut j = journal();
        j.begin().unwrap();
        j.record_image(512, &[1, 2, 3]).unwrap();
        j.record_extend(1024).unwrap();
        j.record_image(0, &[9]).unwrap();

        let records = j.read_records().unwrap();
        assert_eq!(
            records,
            vec![
                JournalRecord::Image {
                    offset: 512,
                    bytes: vec![1, 2, 3]
                },
                JournalRecord::Extend { old_len: 1024 },
                JournalRecord::Image {
                    offset: 0,
                    bytes: vec![9]
                },
            ]
        );
    }

    #[test]
    fn replay_restores_target() {
        let mut target = InMemoryBackend::with_data(vec![0xAA; 8]);

        let mut j = journal();
        j.begin().unwrap();

        // Simulate a transaction: journal, then overwrite; journal, then extend.
        j.record_image(2, &[0xAA, 0xAA]).unwrap();
        target.write_at(2, &[1, 2]).unwrap();
        j.record_extend(8).unwrap();
        target.set_len(16).unwrap();
        target.write_at(10, &[7, 7, 7]).unwrap();

        j.replay(&mut target).unwrap();

        assert_eq!(target.data(), vec![0xAA; 8]);
        assert!(j.is_empty().unwrap());
    }

    #[test]
    fn torn_tail_is_discarded() {
        let mut j = journal();
        j.begin().unwrap();
        j.record_image(0, &[1, 2, 3, 4]).unwrap();

        // Append a half-written record directly.
        let partial = JournalRecord::Image {
            offset: 64,
            bytes: vec![5; 32],
        }
        .encode();
        j.backend.append(&partial[..10]).unwrap();

        let records = j.read_records().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn corrupt_record_is_fatal() {
        let mut j = journal();
        j.begin().unwrap();
        j.record_image(0, &[1, 2, 3, 4]).unwrap();

        // Flip a payload byte of the complete record.
        j.backend.write_at(JOURNAL_HEADER_SIZE + 14, &[0xFF]).unwrap();

        assert!(matches!(
            j.read_records(),
            Err(EngineError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn reset_discards_records() {
        let mut j = journal();
        j.begin().unwrap();
        j.record_image(0, &[1]).unwrap();
        j.reset().unwrap();
        assert!(j.is_empty().unwrap());
        assert!(j.read_records().unwrap().is_empty());
    }
}
