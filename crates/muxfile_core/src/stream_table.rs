//! The stream table: the system stream enumerating all user streams.
//!
//! The table's data area is an array of fixed 44-byte metadata records:
//!
//! ```text
//! | stream id (16) | tag (4) | first segment (8, -1 if absent) |
//! | length (8) | initialized length (8) |
//! ```
//!
//! A record whose id is the reserved empty-space id marks a vacant slot;
//! removing a stream zeroes its slot and appending reuses the first vacant
//! one. The slot count is implicit: the table's capacity divided by the
//! record size.
//!
//! The table cannot describe itself. Its first-segment location lives in
//! the master header and its length is always the sum of its segments'
//! data-area sizes.

use crate::chain::SegmentChain;
use crate::error::{EngineError, EngineResult};
use crate::master::MasterFile;
use crate::types::StreamId;

/// Size of one serialized stream metadata record.
pub(crate) const STREAM_RECORD_SIZE: u64 = 44;

/// Metadata describing one user stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamRecord {
    /// The stream's identifier.
    pub(crate) id: StreamId,
    /// Opaque caller-owned tag.
    pub(crate) tag: u32,
    /// Location of the stream's first segment, absent while empty.
    pub(crate) first_segment: Option<u64>,
    /// Logical stream length in bytes.
    pub(crate) length: u64,
    /// Length of the written prefix; bytes beyond it read as zero.
    pub(crate) initialized: u64,
}

impl StreamRecord {
    /// The record marking an unused slot.
    pub(crate) fn vacant() -> Self {
        Self {
            id: StreamId::EMPTY_SPACE,
            tag: 0,
            first_segment: None,
            length: 0,
            initialized: 0,
        }
    }

    pub(crate) fn is_vacant(&self) -> bool {
        self.id == StreamId::EMPTY_SPACE
    }

    pub(crate) fn encode(&self) -> [u8; STREAM_RECORD_SIZE as usize] {
        let mut buf = [0u8; STREAM_RECORD_SIZE as usize];
        buf[0..16].copy_from_slice(self.id.as_bytes());
        buf[16..20].copy_from_slice(&self.tag.to_le_bytes());
        let first_raw = match self.first_segment {
            Some(v) => v as i64,
            None => -1,
        };
        buf[20..28].copy_from_slice(&first_raw.to_le_bytes());
        buf[28..36].copy_from_slice(&(self.length as i64).to_le_bytes());
        buf[36..44].copy_from_slice(&(self.initialized as i64).to_le_bytes());
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> EngineResult<Self> {
        if bytes.len() < STREAM_RECORD_SIZE as usize {
            return Err(EngineError::bad_format("stream record truncated"));
        }
        let id = StreamId::from_slice(&bytes[0..16])
            .ok_or_else(|| EngineError::bad_format("stream record truncated"))?;
        let tag = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

        let read_i64 = |at: usize| -> i64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            i64::from_le_bytes(raw)
        };
        let first_raw = read_i64(20);
        let first_segment = match first_raw {
            -1 => None,
            v if v >= 0 => Some(v as u64),
            v => {
                return Err(EngineError::bad_format(format!(
                    "stream record has negative first segment {v}"
                )))
            }
        };
        let length = read_i64(28);
        let initialized = read_i64(36);
        if length < 0 || initialized < 0 || initialized > length {
            return Err(EngineError::bad_format(format!(
                "stream record has inconsistent lengths {length}/{initialized}"
            )));
        }

        Ok(Self {
            id,
            tag,
            first_segment,
            length: length as u64,
            initialized: initialized as u64,
        })
    }
}

/// The in-memory image of the stream table.
#[derive(Debug)]
pub(crate) struct StreamTable {
    /// The table's own segment chain.
    pub(crate) chain: SegmentChain,
    /// One record per slot, vacant ones included.
    pub(crate) slots: Vec<StreamRecord>,
}

impl StreamTable {
    /// Loads the table by walking its chain and decoding every slot.
    pub(crate) fn load(master: &MasterFile, first: Option<u64>) -> EngineResult<Self> {
        let chain = SegmentChain::load(master, first)?;
        let slot_count = (chain.total_data_size() / STREAM_RECORD_SIZE) as usize;

        let mut slots = Vec::with_capacity(slot_count);
        if slot_count > 0 {
            let spans = chain.spans(0, slot_count as u64 * STREAM_RECORD_SIZE)?;
            let mut bytes = Vec::with_capacity(slot_count * STREAM_RECORD_SIZE as usize);
            for (offset, len) in spans {
                bytes.extend_from_slice(&master.read(offset, len)?);
            }
            for i in 0..slot_count {
                let at = i * STREAM_RECORD_SIZE as usize;
                slots.push(StreamRecord::decode(
                    &bytes[at..at + STREAM_RECORD_SIZE as usize],
                )?);
            }
        }

        Ok(Self { chain, slots })
    }

    /// The table's derived length: the sum of its segments' data areas.
    pub(crate) fn capacity(&self) -> u64 {
        self.chain.total_data_size()
    }

    /// Finds the slot holding `id`.
    pub(crate) fn find(&self, id: StreamId) -> Option<usize> {
        self.slots
            .iter()
            .position(|record| !record.is_vacant() && record.id == id)
    }

    /// Finds the first vacant slot.
    pub(crate) fn find_vacant(&self) -> Option<usize> {
        self.slots.iter().position(StreamRecord::is_vacant)
    }

    /// Identifiers of all live streams, in slot order.
    pub(crate) fn live_ids(&self) -> Vec<StreamId> {
        self.slots
            .iter()
            .filter(|record| !record.is_vacant())
            .map(|record| record.id)
            .collect()
    }

    /// Number of live streams.
    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().filter(|r| !r.is_vacant()).count()
    }

    /// Writes a record into a slot, in memory and on disk.
    pub(crate) fn write_slot(
        &mut self,
        master: &mut MasterFile,
        slot: usize,
        record: StreamRecord,
    ) -> EngineResult<()> {
        self.slots[slot] = record;
        let bytes = record.encode();
        let spans = self
            .chain
            .spans(slot as u64 * STREAM_RECORD_SIZE, STREAM_RECORD_SIZE)?;
        let mut at = 0usize;
        for (offset, len) in spans {
            master.write(offset, &bytes[at..at + len])?;
            at += len;
        }
        Ok(())
    }

    /// Clears a slot back to vacant.
    pub(crate) fn clear_slot(&mut self, master: &mut MasterFile, slot: usize) -> EngineResult<()> {
        self.write_slot(master, slot, StreamRecord::vacant())
    }

    /// Extends the slot array after the chain has grown, zeroing the new
    /// region so recycled disk space reads as vacant.
    pub(crate) fn extend_slots(&mut self, master: &mut MasterFile, old_capacity: u64) -> EngineResult<()> {
        let new_capacity = self.chain.total_data_size();
        if new_capacity > old_capacity {
            let spans = self.chain.spans(old_capacity, new_capacity - old_capacity)?;
            const ZERO: [u8; 4096] = [0u8; 4096];
            for (offset, len) in spans {
                let mut written = 0usize;
                while written < len {
                    let chunk = (len - written).min(ZERO.len());
                    master.write(offset + written as u64, &ZERO[..chunk])?;
                    written += chunk;
                }
            }
        }
        self.slots.resize(
            (new_capacity / STREAM_RECORD_SIZE) as usize,
            StreamRecord::vacant(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::memory_master;
    use crate::segment::Segment;

    fn table_with_one_block(master: &mut MasterFile) -> StreamTable {
        master.grow(1024).unwrap();
        let mut chain = SegmentChain::empty();
        chain.append(vec![Segment::create(512, 512)]);
        chain.rebuild(master).unwrap();
        // A freshly grown data area is all zeros, so every slot is vacant.
        StreamTable::load(master, Some(512)).unwrap()
    }

    fn record(id_byte: u8, tag: u32) -> StreamRecord {
        StreamRecord {
            id: StreamId::from_bytes([id_byte; 16]),
            tag,
            first_segment: None,
            length: 0,
            initialized: 0,
        }
    }

    #[test]
    fn record_roundtrip() {
        let record = StreamRecord {
            id: StreamId::from_bytes([7; 16]),
            tag: 0xDEAD_BEEF,
            first_segment: Some(1536),
            length: 300,
            initialized: 120,
        };
        let bytes = record.encode();
        let decoded = StreamRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn vacant_record_roundtrip() {
        let bytes = StreamRecord::vacant().encode();
        assert_eq!(bytes, [0u8; 44]);
        assert!(StreamRecord::decode(&bytes).unwrap().is_vacant());
    }

    #[test]
    fn record_rejects_initialized_beyond_length() {
        let mut bytes = record(1, 0).encode();
        bytes[28..36].copy_from_slice(&5i64.to_le_bytes());
        bytes[36..44].copy_from_slice(&9i64.to_le_bytes());
        assert!(StreamRecord::decode(&bytes).is_err());
    }

    #[test]
    fn one_block_table_has_eleven_slots() {
        let mut master = memory_master(512);
        let table = table_with_one_block(&mut master);
        // 492 data bytes hold 11 records of 44 bytes.
        assert_eq!(table.slots.len(), 11);
        assert_eq!(table.capacity(), 492);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn write_find_and_clear() {
        let mut master = memory_master(512);
        let mut table = table_with_one_block(&mut master);

        let a = record(1, 10);
        let b = record(2, 20);
        table.write_slot(&mut master, 0, a).unwrap();
        table.write_slot(&mut master, 3, b).unwrap();

        assert_eq!(table.find(a.id), Some(0));
        assert_eq!(table.find(b.id), Some(3));
        assert_eq!(table.find_vacant(), Some(1));
        assert_eq!(table.live_ids(), vec![a.id, b.id]);

        table.clear_slot(&mut master, 0).unwrap();
        assert_eq!(table.find(a.id), None);
        assert_eq!(table.find_vacant(), Some(0));
    }

    #[test]
    fn load_reads_slots_back() {
        let mut master = memory_master(512);
        let mut table = table_with_one_block(&mut master);

        let a = record(9, 42);
        table.write_slot(&mut master, 5, a).unwrap();

        let reloaded = StreamTable::load(&master, Some(512)).unwrap();
        assert_eq!(reloaded.slots.len(), 11);
        assert_eq!(reloaded.find(a.id), Some(5));
        assert_eq!(reloaded.slots[5], a);
    }
}
