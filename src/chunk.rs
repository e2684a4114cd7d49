//! # Chunk Tracker Module
//!
//! A [ChunkList] keeps a bounded set of byte ranges of a file, sorted by offset and never
//! overlapping. It is used in two roles:
//!
//! * By the receiving side to track the file data which was already received. The complement
//!   of the list within the file size ([ChunkList::compute_gaps]) yields the segment requests of
//!   a NAK PDU.
//! * By the sending side to track ranges which were requested by a NAK and not retransmitted
//!   yet. [ChunkList::remove_from_first] hands out those ranges piecewise.
//!
//! The capacity of a list is fixed at creation time. Adding a range which touches or overlaps an
//! existing one always succeeds because it is merged. A disjoint range is rejected with
//! [ChunkError::ListFull] once the capacity is exhausted, leaving the existing entries intact.
use alloc::vec::Vec;

use crate::pdu::{SegmentList, SegmentRequest};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum ChunkError {
    #[error("chunk list is full")]
    ListFull,
    #[error("chunk at offset {offset} with size {size} exceeds the addressable range")]
    InvalidChunk { offset: u64, size: u64 },
}

/// Byte range of a file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, derive_new::new)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Chunk {
    pub offset: u64,
    pub size: u64,
}

impl Chunk {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone)]
pub struct ChunkList {
    chunks: Vec<Chunk>,
    max_chunks: usize,
}

impl ChunkList {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: Vec::with_capacity(max_chunks),
            max_chunks,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_chunks
    }

    #[inline]
    pub fn reset(&mut self) {
        self.chunks.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    #[inline]
    pub fn first(&self) -> Option<&Chunk> {
        self.chunks.first()
    }

    /// Insert a range. Overlapping or adjacent neighbours on both sides are merged into a
    /// single entry. Empty ranges are accepted and ignored.
    pub fn add(&mut self, offset: u64, size: u64) -> Result<(), ChunkError> {
        if size == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(size)
            .ok_or(ChunkError::InvalidChunk { offset, size })?;
        // First entry whose end reaches the new range. Everything before it is disjoint and
        // not adjacent.
        let first = self.chunks.partition_point(|chunk| chunk.end() < offset);
        // First entry starting strictly after the new range, so neither overlapping nor adjacent.
        let last = self.chunks.partition_point(|chunk| chunk.offset <= end);
        if first == last {
            if self.chunks.len() >= self.max_chunks {
                return Err(ChunkError::ListFull);
            }
            self.chunks.insert(first, Chunk::new(offset, size));
            return Ok(());
        }
        let merged_start = core::cmp::min(offset, self.chunks[first].offset);
        let merged_end = core::cmp::max(end, self.chunks[last - 1].end());
        self.chunks[first] = Chunk::new(merged_start, merged_end - merged_start);
        self.chunks.drain(first + 1..last);
        Ok(())
    }

    /// Take up to `max_size` bytes from the start of the first range. The range shrinks from
    /// the front and is removed once empty.
    pub fn remove_from_first(&mut self, max_size: u64) -> Option<Chunk> {
        if max_size == 0 {
            return None;
        }
        let first = self.chunks.first_mut()?;
        let taken = Chunk::new(first.offset, core::cmp::min(first.size, max_size));
        first.offset += taken.size;
        first.size -= taken.size;
        if first.size == 0 {
            self.chunks.remove(0);
        }
        Some(taken)
    }

    /// Whether the list covers the whole range `[0, total)`.
    pub fn is_complete(&self, total: u64) -> bool {
        if total == 0 {
            return true;
        }
        self.chunks
            .first()
            .is_some_and(|chunk| chunk.offset == 0 && chunk.size >= total)
    }

    /// Number of bytes covered by the list.
    pub fn covered_bytes(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.size).sum()
    }

    /// End offset of the last range, zero for an empty list.
    #[inline]
    pub fn extent(&self) -> u64 {
        self.chunks.last().map_or(0, Chunk::end)
    }

    /// Complement of the list within `[0, total)`, as NAK segment requests. At most `max_gaps`
    /// requests are produced, in offset order.
    pub fn compute_gaps(&self, total: u64, max_gaps: usize) -> SegmentList {
        let mut gaps = SegmentList::new();
        let max_gaps = core::cmp::min(max_gaps, gaps.inline_size());
        let mut cursor = 0;
        for chunk in &self.chunks {
            if gaps.len() >= max_gaps || cursor >= total {
                return gaps;
            }
            if chunk.offset > cursor {
                gaps.push(SegmentRequest::new(
                    cursor,
                    core::cmp::min(chunk.offset, total),
                ));
            }
            cursor = core::cmp::max(cursor, chunk.end());
        }
        if cursor < total && gaps.len() < max_gaps {
            gaps.push(SegmentRequest::new(cursor, total));
        }
        gaps
    }
}
