//! Chunk planning
//!
//! Splits `[0, content_length)` into contiguous top-level chunks, one per
//! connection, and slices each chunk into bounded windows when a chunk size
//! limit is configured. Windows never get their own chunk id: the worker
//! owning the chunk requests them one after another.

use fastdl_types::{ChunkId, ChunkRange, MAX_SIMULTANEOUS_CONNECTIONS};

/// Ordered list of chunks for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunks: Vec<ChunkRange>,
    pub chunk_size_limit: Option<u64>,
    /// Whether the chunks are fetched with range requests
    pub simultaneous: bool,
}

impl ChunkPlan {
    /// Effective number of connections
    pub fn connections(&self) -> usize {
        self.chunks.len()
    }

    /// Windows the worker for `id` will request, in order
    pub fn windows(&self, id: ChunkId) -> Option<SubRanges> {
        self.chunks
            .get(id as usize)
            .map(|range| sub_ranges(range, self.chunk_size_limit))
    }
}

/// Build the chunk plan.
///
/// Without range support, or without a known non-zero length, the plan is a
/// single unbounded chunk and the limit is dropped. Otherwise the resource is
/// divided into `min(requested, MAX)` near-equal ranges (fewer when the
/// resource has fewer bytes than that); the last range absorbs the remainder.
pub fn plan(
    content_length: Option<u64>,
    accepts_ranges: bool,
    requested_connections: usize,
    chunk_size_limit: Option<u64>,
) -> ChunkPlan {
    let length = match content_length {
        Some(length) if accepts_ranges && length > 0 => length,
        _ => {
            return ChunkPlan {
                chunks: vec![ChunkRange::unbounded(0)],
                chunk_size_limit: None,
                simultaneous: false,
            }
        }
    };

    let count = (requested_connections.clamp(1, MAX_SIMULTANEOUS_CONNECTIONS) as u64).min(length);
    let base = length / count;

    let chunks = (0..count)
        .map(|i| {
            let start = i * base;
            let end = if i == count - 1 {
                length - 1
            } else {
                (i + 1) * base - 1
            };
            ChunkRange::new(i as ChunkId, start, end)
        })
        .collect();

    ChunkPlan {
        chunks,
        chunk_size_limit: chunk_size_limit.filter(|limit| *limit > 0),
        simultaneous: true,
    }
}

/// Consecutive windows of at most `limit` bytes covering `range`.
///
/// An unbounded range, or one no larger than the limit, yields itself.
pub fn sub_ranges(range: &ChunkRange, limit: Option<u64>) -> SubRanges {
    SubRanges {
        range: *range,
        next_start: Some(range.start),
        limit: limit.filter(|limit| *limit > 0),
    }
}

/// Iterator returned by [`sub_ranges`]
#[derive(Debug, Clone)]
pub struct SubRanges {
    range: ChunkRange,
    next_start: Option<u64>,
    limit: Option<u64>,
}

impl Iterator for SubRanges {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        let start = self.next_start?;

        let (end, limit) = match (self.range.end, self.limit) {
            (Some(end), Some(limit)) => (end, limit),
            _ => {
                self.next_start = None;
                return Some(ChunkRange {
                    start,
                    ..self.range
                });
            }
        };

        let window_end = start.saturating_add(limit - 1).min(end);
        self.next_start = if window_end < end {
            Some(window_end + 1)
        } else {
            None
        };

        Some(ChunkRange::new(self.range.id, start, window_end))
    }
}
