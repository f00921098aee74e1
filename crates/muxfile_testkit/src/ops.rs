//! Property-based test generators using proptest.
//!
//! Operations address streams through a small pool of slot numbers so that
//! random sequences actually revisit the same streams: create, write,
//! resize, read, and delete collide often enough to exercise free-space
//! reuse and table slot recycling.

use muxfile_core::StreamId;
use proptest::prelude::*;

/// Number of distinct stream slots a generated sequence draws from.
pub const SLOT_POOL: u8 = 4;

/// Maps a generated slot number to its stream identifier.
#[must_use]
pub fn slot_id(slot: u8) -> StreamId {
    StreamId::from_bytes([slot + 1; 16])
}

/// One step of a random storage workload.
#[derive(Debug, Clone)]
pub enum StorageOp {
    /// Create the slot's stream.
    Create {
        /// Slot to create.
        slot: u8,
        /// Tag to store with it.
        tag: u32,
    },
    /// Delete the slot's stream.
    Delete {
        /// Slot to delete.
        slot: u8,
    },
    /// Write bytes at a position.
    Write {
        /// Slot to write into.
        slot: u8,
        /// Absolute position of the write.
        position: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Resize the stream.
    SetLength {
        /// Slot to resize.
        slot: u8,
        /// New logical length.
        value: u64,
    },
    /// Read bytes at a position and compare against the model.
    Read {
        /// Slot to read from.
        slot: u8,
        /// Absolute position of the read.
        position: u64,
        /// Number of bytes requested.
        len: usize,
    },
}

/// Strategy for payload bytes.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

fn slot_strategy() -> impl Strategy<Value = u8> {
    0..SLOT_POOL
}

/// Strategy for a single operation.
pub fn op_strategy() -> impl Strategy<Value = StorageOp> {
    prop_oneof![
        2 => (slot_strategy(), any::<u32>())
            .prop_map(|(slot, tag)| StorageOp::Create { slot, tag }),
        1 => slot_strategy().prop_map(|slot| StorageOp::Delete { slot }),
        4 => (slot_strategy(), 0u64..8192, payload_strategy())
            .prop_map(|(slot, position, data)| StorageOp::Write { slot, position, data }),
        2 => (slot_strategy(), 0u64..16384)
            .prop_map(|(slot, value)| StorageOp::SetLength { slot, value }),
        3 => (slot_strategy(), 0u64..16384, 0usize..4096)
            .prop_map(|(slot, position, len)| StorageOp::Read { slot, position, len }),
    ]
}

/// Strategy for a whole workload.
pub fn ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<StorageOp>> {
    prop::collection::vec(op_strategy(), 1..max_len)
}
