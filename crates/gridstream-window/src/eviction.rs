//! Frequency-weighted recency eviction
//!
//! A chunk scores `access_count * weight_ms - idle_ms`; the lowest score is
//! evicted. Equal scores evict the least recently used.

use std::time::Duration;

use crate::chunk::ChunkKey;

/// What the policy needs to know about one resident chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub key: ChunkKey,
    pub access_count: u64,
    pub idle: Duration,
    /// Position in recency order, 0 being the least recently used.
    pub recency_rank: usize,
}

pub fn score(access_count: u64, idle: Duration, weight_ms: u64) -> i128 {
    i128::from(access_count) * i128::from(weight_ms) - idle.as_millis() as i128
}

/// Pick the chunk to evict, or `None` when there are no candidates.
pub fn select_victim<I>(candidates: I, weight_ms: u64) -> Option<ChunkKey>
where
    I: IntoIterator<Item = Candidate>,
{
    candidates
        .into_iter()
        .min_by_key(|c| (score(c.access_count, c.idle, weight_ms), c.recency_rank))
        .map(|c| c.key)
}
