//! Splitting a slice range into independently processable work units.
//!
//! Both policies are pure functions of their inputs, so every worker can
//! enumerate its own units without talking to any other worker.

use serde::{Deserialize, Serialize};
use std::{fmt, iter::StepBy, ops::Range};
use thiserror::Error;

/// Default number of slices per chunk, a balance between parallelism and peak memory
pub const DEFAULT_CHUNK_SIZE: u32 = 50;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Chunk size must be at least 1")]
    ZeroChunkSize,
    #[error("Number of ranks must be at least 1")]
    ZeroRanks,
    #[error("Rank {rank} is out of bounds for {size} ranks")]
    RankOutOfBounds { rank: u32, size: u32 },
}

/// Half open range `[start, stop)` of slice indices
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SliceRange {
    pub start: u32,
    pub stop: u32,
}

impl SliceRange {
    /// an inverted range is treated as empty
    pub fn new(start: u32, stop: u32) -> Self {
        Self {
            start,
            stop: stop.max(start),
        }
    }

    pub fn len(&self) -> u32 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }
}

impl From<Range<u32>> for SliceRange {
    fn from(range: Range<u32>) -> Self {
        Self::new(range.start, range.end)
    }
}

impl fmt::Display for SliceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// One slab of the volume, consumed exactly once by the reconstruction step
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnit {
    Chunk(SliceRange),
    Slice(u32),
}

impl WorkUnit {
    /// the slices covered by this unit
    pub fn slices(&self) -> SliceRange {
        match self {
            Self::Chunk(range) => *range,
            Self::Slice(index) => SliceRange::new(*index, index.saturating_add(1)),
        }
    }

    /// first slice index, used as the start index of the persisted stack
    pub fn first(&self) -> u32 {
        self.slices().start
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunk(range) => write!(f, "chunk {range}"),
            Self::Slice(index) => write!(f, "slice {index}"),
        }
    }
}

/// All supported partitioning policies
/// These should be built with `Partitioner::chunked` or `Partitioner::ranked`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partitioner {
    /// contiguous chunks processed in order by a single controller
    Chunked { chunk_size: u32 },
    /// round robin assignment of single slices to one of `size` ranks
    Ranked { rank: u32, size: u32 },
}

impl Partitioner {
    pub fn chunked(chunk_size: u32) -> Result<Self, PartitionError> {
        if chunk_size == 0 {
            Err(PartitionError::ZeroChunkSize)
        } else {
            Ok(Self::Chunked { chunk_size })
        }
    }

    pub fn ranked(rank: u32, size: u32) -> Result<Self, PartitionError> {
        if size == 0 {
            Err(PartitionError::ZeroRanks)
        } else if rank >= size {
            Err(PartitionError::RankOutOfBounds { rank, size })
        } else {
            Ok(Self::Ranked { rank, size })
        }
    }

    /// enumerate the units this policy assigns within `range`
    pub fn units(&self, range: SliceRange) -> WorkUnits {
        match *self {
            Self::Chunked { chunk_size } => WorkUnits::Chunks {
                next: range.start,
                stop: range.stop,
                chunk_size,
            },
            Self::Ranked { rank, size } => WorkUnits::Slices(
                // a rank past the end of the range simply owns nothing
                (range.start.saturating_add(rank).min(range.stop)..range.stop)
                    .step_by(size.max(1) as usize),
            ),
        }
    }
}

/// Iterator over the work units of one partitioner
#[derive(Clone, Debug)]
pub enum WorkUnits {
    Chunks { next: u32, stop: u32, chunk_size: u32 },
    Slices(StepBy<Range<u32>>),
}

impl Iterator for WorkUnits {
    type Item = WorkUnit;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Chunks {
                next,
                stop,
                chunk_size,
            } => {
                if *next >= *stop {
                    return None;
                }

                let start = *next;
                let end = start.saturating_add((*chunk_size).max(1)).min(*stop);
                *next = end;

                Some(WorkUnit::Chunk(SliceRange::new(start, end)))
            }
            Self::Slices(indices) => indices.next().map(WorkUnit::Slice),
        }
    }

    /// exact size for the remaining units
    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::Chunks {
                next,
                stop,
                chunk_size,
            } => {
                let remaining = stop.saturating_sub(*next) as usize;
                let chunk_size = (*chunk_size).max(1) as usize;
                let len = (remaining + chunk_size - 1) / chunk_size;

                (len, Some(len))
            }
            Self::Slices(indices) => indices.size_hint(),
        }
    }
}

impl ExactSizeIterator for WorkUnits {}

#[cfg(test)]
mod partition_test;
