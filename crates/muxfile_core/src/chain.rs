//! Segment chains: the linked lists backing logical streams.
//!
//! A chain is the in-memory image of one stream's singly linked segment
//! list. Chain order defines the stream's logical byte layout: the data
//! areas of its segments, concatenated in chain order.

use crate::error::{EngineError, EngineResult};
use crate::master::MasterFile;
use crate::segment::{Segment, SplitOutcome};
use std::collections::HashSet;

/// An ordered list of segments forming one stream.
#[derive(Debug, Default)]
pub(crate) struct SegmentChain {
    segments: Vec<Segment>,
}

impl SegmentChain {
    /// Creates an empty chain.
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Loads a chain by walking next pointers from `first`.
    ///
    /// Every header is checksum-validated on the way. A repeated location
    /// means the on-disk list is cyclic and the file is rejected.
    pub(crate) fn load(master: &MasterFile, first: Option<u64>) -> EngineResult<Self> {
        let mut segments = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = first;
        while let Some(location) = cursor {
            if !seen.insert(location) {
                return Err(EngineError::bad_format(format!(
                    "segment chain cycle at offset {location}"
                )));
            }
            let segment = Segment::load(master, location)?;
            cursor = segment.next();
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub(crate) fn first_location(&self) -> Option<u64> {
        self.segments.first().map(Segment::location)
    }

    /// Total payload capacity of the chain in bytes.
    pub(crate) fn total_data_size(&self) -> u64 {
        self.segments.iter().map(Segment::data_size).sum()
    }

    /// Appends segments at the end of the chain (stream growth).
    pub(crate) fn append(&mut self, segments: Vec<Segment>) {
        self.segments.extend(segments);
    }

    /// Merge-inserts segments keeping the chain sorted by location
    /// (free-space order).
    pub(crate) fn insert_sorted(&mut self, segments: Vec<Segment>) {
        for segment in segments {
            let at = self
                .segments
                .partition_point(|s| s.location() < segment.location());
            self.segments.insert(at, segment);
        }
    }

    /// Removes and returns every segment, leaving the chain empty.
    pub(crate) fn clear_into(&mut self) -> Vec<Segment> {
        std::mem::take(&mut self.segments)
    }

    /// Fixes the chain up after a mutation.
    ///
    /// Walks forward once, merging each segment with its successor when the
    /// two are physically adjacent, then rewrites every header whose size or
    /// next pointer changed.
    pub(crate) fn rebuild(&mut self, master: &mut MasterFile) -> EngineResult<()> {
        let mut i = 0;
        while i + 1 < self.segments.len() {
            if self.segments[i].end() == self.segments[i + 1].location() {
                let next = self.segments.remove(i + 1);
                self.segments[i].absorb(&next);
            } else {
                i += 1;
            }
        }

        let count = self.segments.len();
        for i in 0..count {
            let next_location = if i + 1 < count {
                Some(self.segments[i + 1].location())
            } else {
                None
            };
            self.segments[i].set_next(next_location);
            if self.segments[i].is_dirty() {
                self.segments[i].persist(master)?;
            }
        }
        Ok(())
    }

    /// Removes roughly `amount` data-area bytes from the head of the chain,
    /// splitting the first segment when it is larger than needed.
    ///
    /// Returns the detached segments and the number of bytes that could not
    /// be satisfied because the chain ran dry. Detached segments keep stale
    /// next pointers; the receiving chain's rebuild repairs them.
    pub(crate) fn take_front(
        &mut self,
        master: &MasterFile,
        amount: u64,
    ) -> EngineResult<(Vec<Segment>, u64)> {
        let block = master.block_size();
        let mut taken = Vec::new();
        let mut remaining = amount;

        while remaining > 0 && !self.is_empty() {
            match self.segments[0].split(remaining, false, block) {
                SplitOutcome::TakeWhole => {
                    let segment = self.segments.remove(0);
                    remaining = remaining.saturating_sub(segment.data_size());
                    taken.push(segment);
                }
                SplitOutcome::Split(piece) => {
                    // The piece is rounded up, so it always covers the rest.
                    remaining = 0;
                    taken.push(piece);
                }
            }
        }

        Ok((taken, remaining))
    }

    /// Removes up to `amount` data-area bytes from the tail of the chain.
    ///
    /// Whole segments are popped while they fit; at most one tail split
    /// follows. A refused split ends the walk and the surplus capacity
    /// stays with the stream.
    pub(crate) fn take_back(&mut self, master: &MasterFile, amount: u64) -> EngineResult<Vec<Segment>> {
        let block = master.block_size();
        let mut freed = Vec::new();
        let mut remaining = amount;

        while remaining > 0 {
            let Some(last) = self.segments.last() else {
                break;
            };
            if last.data_size() <= remaining {
                remaining -= last.data_size();
                if let Some(segment) = self.segments.pop() {
                    freed.push(segment);
                }
                continue;
            }
            let Some(last) = self.segments.last_mut() else {
                break;
            };
            match last.split(remaining, true, block) {
                SplitOutcome::TakeWhole => break,
                SplitOutcome::Split(piece) => {
                    freed.push(piece);
                    break;
                }
            }
        }

        Ok(freed)
    }

    /// Maps a logical byte range onto file ranges.
    ///
    /// Returns `(file offset, length)` pairs covering `[start, start + len)`
    /// of the chain's concatenated data areas, in order.
    pub(crate) fn spans(&self, start: u64, len: u64) -> EngineResult<Vec<(u64, usize)>> {
        let mut out = Vec::new();
        let mut skip = start;
        let mut remaining = len;

        for segment in &self.segments {
            if remaining == 0 {
                break;
            }
            let data_size = segment.data_size();
            if skip >= data_size {
                skip -= data_size;
                continue;
            }
            let take = remaining.min(data_size - skip);
            out.push((segment.data_start() + skip, take as usize));
            remaining -= take;
            skip = 0;
        }

        if remaining > 0 {
            return Err(EngineError::out_of_bounds(format!(
                "range [{start}, {}) exceeds chain capacity {}",
                start + len,
                self.total_data_size()
            )));
        }
        Ok(out)
    }
}
