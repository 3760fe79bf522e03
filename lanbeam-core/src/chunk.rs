//! Chunk planning: split a payload into fixed-size, index-addressed chunks.

use std::ops::Range;

use crate::config::DIRECT_CHUNK_SIZE;

/// Number of chunks for `file_size` bytes: `ceil(file_size / chunk_size)`.
/// A zero chunk size falls back to the direct-transport default.
pub fn total_chunks(file_size: u64, chunk_size: u32) -> u32 {
    let size = effective_size(chunk_size);
    file_size.div_ceil(size) as u32
}

fn effective_size(chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        DIRECT_CHUNK_SIZE as u64
    } else {
        chunk_size as u64
    }
}

/// How one transfer is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u32) -> Self {
        let chunk_size = effective_size(chunk_size) as u32;
        Self {
            file_size,
            chunk_size,
            total_chunks: total_chunks(file_size, chunk_size),
        }
    }

    /// Byte range of chunk `index` (HTTP-range style, end exclusive).
    pub fn range(&self, index: u32) -> Range<u64> {
        let start = (index as u64 * self.chunk_size as u64).min(self.file_size);
        let end = (start + self.chunk_size as u64).min(self.file_size);
        start..end
    }

    /// Slice chunk `index` out of an in-memory payload.
    pub fn slice<'a>(&self, data: &'a [u8], index: u32) -> &'a [u8] {
        let r = self.range(index);
        &data[r.start as usize..r.end as usize]
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u32, Range<u64>)> + '_ {
        (0..self.total_chunks).map(move |i| (i, self.range(i)))
    }
}
