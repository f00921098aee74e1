//! Segments: block-aligned regions forming singly linked chains.
//!
//! Every byte of the master file past block 0 belongs to exactly one live
//! segment. A segment starts with a fixed 20-byte header; the rest is its
//! data area.
//!
//! ## Header Format
//!
//! ```text
//! | size (8) | next location (8, -1 if tail) | crc32 (4) |
//! ```
//!
//! The checksum covers the segment's location, size, and next location, so
//! a header read back from the wrong offset fails validation.

use crate::error::{EngineError, EngineResult};
use crate::master::MasterFile;

/// Size of the on-disk segment header in bytes.
pub const SEGMENT_HEADER_SIZE: u64 = 20;

/// Computes a CRC32 checksum (IEEE polynomial) for data.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Outcome of attempting to split a segment.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SplitOutcome {
    /// The split was refused; the caller must take or keep the whole
    /// segment.
    TakeWhole,
    /// The segment was partitioned; the detached piece is returned and the
    /// receiver was adjusted to cover the remainder.
    Split(Segment),
}

/// A contiguous block-aligned region of the master file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    location: u64,
    size: u64,
    next: Option<u64>,
    dirty: bool,
}

impl Segment {
    /// Creates a fresh, unpersisted segment.
    pub(crate) fn create(location: u64, size: u64) -> Self {
        Self {
            location,
            size,
            next: None,
            dirty: true,
        }
    }

    /// Loads and validates a segment header from the master file.
    pub(crate) fn load(master: &MasterFile, location: u64) -> EngineResult<Self> {
        let block = master.block_size();
        let file_len = master.len()?;

        if location % block != 0 || location < block {
            return Err(EngineError::bad_format(format!(
                "segment location {location} is not block-aligned"
            )));
        }
        if location + SEGMENT_HEADER_SIZE > file_len {
            return Err(EngineError::bad_format(format!(
                "segment location {location} is beyond end of file"
            )));
        }

        let header = master.read(location, SEGMENT_HEADER_SIZE as usize)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&header[0..8]);
        let size = u64::from_le_bytes(raw);
        raw.copy_from_slice(&header[8..16]);
        let next_raw = i64::from_le_bytes(raw);
        let mut crc_raw = [0u8; 4];
        crc_raw.copy_from_slice(&header[16..20]);
        let expected = u32::from_le_bytes(crc_raw);

        let actual = Self::checksum(location, size, next_raw);
        if expected != actual {
            return Err(EngineError::ChecksumMismatch {
                location,
                expected,
                actual,
            });
        }

        if size < block || size % block != 0 {
            return Err(EngineError::bad_format(format!(
                "segment at {location} has invalid size {size}"
            )));
        }
        if location + size > file_len {
            return Err(EngineError::bad_format(format!(
                "segment at {location} extends beyond end of file"
            )));
        }
        let next = match next_raw {
            -1 => None,
            v if v >= 0 => Some(v as u64),
            v => {
                return Err(EngineError::bad_format(format!(
                    "segment at {location} has negative next location {v}"
                )))
            }
        };

        Ok(Self {
            location,
            size,
            next,
            dirty: false,
        })
    }

    /// Writes the header back. The data area is left untouched.
    pub(crate) fn persist(&mut self, master: &mut MasterFile) -> EngineResult<()> {
        let next_raw = match self.next {
            Some(v) => v as i64,
            None => -1,
        };
        let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE as usize);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&next_raw.to_le_bytes());
        buf.extend_from_slice(&Self::checksum(self.location, self.size, next_raw).to_le_bytes());
        master.write(self.location, &buf)?;
        self.dirty = false;
        Ok(())
    }

    fn checksum(location: u64, size: u64, next_raw: i64) -> u32 {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&location.to_le_bytes());
        buf[8..16].copy_from_slice(&size.to_le_bytes());
        buf[16..24].copy_from_slice(&next_raw.to_le_bytes());
        compute_crc32(&buf)
    }

    pub(crate) fn location(&self) -> u64 {
        self.location
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn next(&self) -> Option<u64> {
        self.next
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// End of the segment, exclusive. Also the end of its data area.
    pub(crate) fn end(&self) -> u64 {
        self.location + self.size
    }

    /// First byte of the data area.
    pub(crate) fn data_start(&self) -> u64 {
        self.location + SEGMENT_HEADER_SIZE
    }

    /// Number of payload bytes this segment contributes to its stream.
    pub(crate) fn data_size(&self) -> u64 {
        self.size - SEGMENT_HEADER_SIZE
    }

    pub(crate) fn set_next(&mut self, next: Option<u64>) {
        if self.next != next {
            self.next = next;
            self.dirty = true;
        }
    }

    /// Splits this segment so that roughly `amount` data-area bytes can be
    /// detached.
    ///
    /// With `split_at_end` false the detached piece is carved from the
    /// front and sized to hold at least `amount` data bytes (header
    /// included, rounded up to a whole block); this segment moves forward
    /// to cover the remainder. With `split_at_end` true the piece is carved
    /// from the tail and sized to at most `amount` bytes rounded down to a
    /// whole block.
    ///
    /// The split is refused when either resulting segment would be smaller
    /// than one block; the caller must then take or keep the whole segment.
    pub(crate) fn split(&mut self, amount: u64, split_at_end: bool, block: u64) -> SplitOutcome {
        let raw = if split_at_end {
            amount.saturating_sub(SEGMENT_HEADER_SIZE)
        } else {
            amount + SEGMENT_HEADER_SIZE
        };

        let mut new_size = raw - raw % block;
        if !split_at_end && raw % block != 0 {
            new_size += block;
        }

        if new_size < block {
            return SplitOutcome::TakeWhole;
        }
        if self.size.saturating_sub(new_size) < block {
            return SplitOutcome::TakeWhole;
        }

        let piece = if split_at_end {
            let piece = Segment::create(self.location + self.size - new_size, new_size);
            self.size -= new_size;
            piece
        } else {
            let piece = Segment::create(self.location, new_size);
            self.location += new_size;
            self.size -= new_size;
            piece
        };
        self.dirty = true;
        SplitOutcome::Split(piece)
    }

    /// Merges an immediately adjacent successor into this segment.
    ///
    /// The caller guarantees `self.end() == next.location()`.
    pub(crate) fn absorb(&mut self, next: &Segment) {
        self.size += next.size;
        self.next = next.next;
        self.dirty = true;
    }
}
