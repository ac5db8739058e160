//! Chunk geometry: fixed-size windows over a file and the mapping from a
//! byte range back onto the chunks that hold it.

use crate::error::PoolError;
use crate::manifest::ChunkDescriptor;

/// One upload window: `len == chunk_size` for all but possibly the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

/// Plan the windows for a file. An empty file has zero windows.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkWindow>, PoolError> {
    if chunk_size == 0 {
        return Err(PoolError::InvalidChunkSize);
    }
    let mut windows = Vec::new();
    let mut offset = 0u64;
    let mut index = 0u32;
    while offset < file_size {
        let len = chunk_size.min(file_size - offset);
        windows.push(ChunkWindow { index, offset, len });
        offset += len;
        index += 1;
    }
    Ok(windows)
}

/// A partial read of one chunk: skip `skip` bytes into it, take `take`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpan {
    pub chunk_index: usize,
    pub skip: u64,
    pub take: u64,
}

/// Map `[start, start+len)` onto the chunks that cover it, in cursor order.
/// Assumes descriptors are index-ordered with gap-free offsets (manifest
/// invariants).
pub fn split_range(chunks: &[ChunkDescriptor], start: u64, len: u64) -> Vec<RangeSpan> {
    let mut spans = Vec::new();
    if len == 0 {
        return spans;
    }
    let mut cursor = start;
    let mut remaining = len;
    for (i, chunk) in chunks.iter().enumerate() {
        let chunk_end = chunk.offset + chunk.size;
        if cursor >= chunk_end {
            continue;
        }
        if chunk.offset >= cursor + remaining {
            break;
        }
        let skip = cursor.saturating_sub(chunk.offset);
        let take = (chunk.size - skip).min(remaining);
        spans.push(RangeSpan {
            chunk_index: i,
            skip,
            take,
        });
        cursor += take;
        remaining -= take;
        if remaining == 0 {
            break;
        }
    }
    spans
}
