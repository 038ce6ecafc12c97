//! Chunk addressing and cached chunk contents

use gridstream_common::Row;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::time::Instant;

/// Index of a fixed-size block of rows: `row / chunk_size`.
pub type ChunkKey = u64;

pub fn chunk_key(row: u64, chunk_size: u64) -> ChunkKey {
    row / chunk_size.max(1)
}

/// Keys of every chunk overlapping `[start, end]`.
pub fn chunk_span(start: u64, end: u64, chunk_size: u64) -> RangeInclusive<ChunkKey> {
    chunk_key(start, chunk_size)..=chunk_key(end, chunk_size)
}

/// First row index of `key`.
pub fn chunk_offset(key: ChunkKey, chunk_size: u64) -> u64 {
    key.saturating_mul(chunk_size)
}

/// One resident chunk.
#[derive(Debug, Clone)]
pub struct CachedChunk {
    /// Shared with any request that captured this chunk before it was evicted.
    pub rows: Arc<Vec<Row>>,
    pub etag: Option<String>,
    pub last_access: Instant,
    pub access_count: u64,
}

impl CachedChunk {
    pub fn new(rows: Vec<Row>, etag: Option<String>, now: Instant) -> Self {
        Self {
            rows: Arc::new(rows),
            etag,
            last_access: now,
            access_count: 1,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_access = now;
    }
}
