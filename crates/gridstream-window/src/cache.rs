//! Windowed chunk cache over a remote row-range service
//!
//! [`WindowCache`] is a cloneable handle to an actor task that exclusively
//! owns the cache state. Fetches run as separate tasks and report back as
//! messages, so every mutation (insert, evict, touch, invalidate) happens on
//! the actor, one message at a time.
//!
//! Invariants kept by the actor:
//! - at most `max_cached_chunks` chunks are resident, evicting before insert
//! - a key has at most one fetch in flight; later requests join it
//! - completions from an earlier epoch or a superseded fetch are discarded

use gridstream_common::{ColumnInfo, GridError, IndexedRow, Result, Row};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::chunk::{chunk_key, chunk_offset, chunk_span, CachedChunk, ChunkKey};
use crate::config::CacheConfig;
use crate::criteria::Criteria;
use crate::eviction::{select_victim, Candidate};
use crate::service::{FetchOutcome, RowRangeRequest, RowRangeService};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Rows answering one range request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RowWindow {
    /// Ascending by index. Rows the service did not return are absent.
    pub rows: Vec<IndexedRow>,
    pub row_count: u64,
    /// False while `row_count` is inferred rather than reported by the service.
    pub row_count_known: bool,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cached_chunks: usize,
    pub inflight: usize,
    pub fetches_issued: u64,
    /// Chunk lookups answered from the cache.
    pub hits: u64,
    pub evictions: u64,
    pub not_modified: u64,
    pub epoch: u64,
}

enum Command {
    EnsureRange {
        start: u64,
        end: u64,
        revalidate: bool,
        reply: oneshot::Sender<Result<RowWindow>>,
    },
    SetCriteria {
        criteria: Criteria,
        reply: oneshot::Sender<()>,
    },
    InvalidateRows {
        rows: Vec<u64>,
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
}

struct FetchDone {
    key: ChunkKey,
    fetch_id: u64,
    epoch: u64,
    outcome: Result<FetchOutcome>,
}

struct InflightFetch {
    fetch_id: u64,
    token: CancellationToken,
}

/// A range request waiting on one or more chunk fetches.
struct Waiter {
    start: u64,
    end: u64,
    pending: HashSet<ChunkKey>,
    /// Chunk contents captured as they became available.
    captured: BTreeMap<ChunkKey, Arc<Vec<Row>>>,
    reply: oneshot::Sender<Result<RowWindow>>,
}

/// Handle to a running chunk cache for one table.
///
/// Dropping every clone stops the cache and cancels its in-flight fetches.
#[derive(Clone)]
pub struct WindowCache {
    commands: mpsc::Sender<Command>,
    table: Arc<str>,
}

impl WindowCache {
    /// Start a cache for `table` on the current tokio runtime.
    pub fn spawn(service: Arc<dyn RowRangeService>, table: impl Into<String>, config: &CacheConfig) -> Self {
        let table: String = table.into();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let actor = CacheActor {
            service,
            table: table.clone(),
            chunk_size: config.chunk_size.max(1),
            max_cached_chunks: config.max_cached_chunks.max(1),
            frequency_weight_ms: config.frequency_weight_ms,
            chunks: HashMap::new(),
            access_order: VecDeque::new(),
            inflight: HashMap::new(),
            waiters: Vec::new(),
            criteria: Criteria::default(),
            columns: Vec::new(),
            reported_row_count: None,
            highest_seen: None,
            epoch: 0,
            epoch_token: CancellationToken::new(),
            next_fetch_id: 0,
            stats: CacheStats::default(),
            done_tx,
        };

        info!(
            table = %table,
            chunk_size = actor.chunk_size,
            max_cached_chunks = actor.max_cached_chunks,
            "Starting window cache"
        );

        tokio::spawn(
            actor
                .run(command_rx, done_rx)
                .instrument(info_span!("window_cache", table = %table)),
        );

        Self {
            commands: command_tx,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Make every row in `[start, end]` resident and return the cached rows.
    ///
    /// Once the service has reported a row count, the range is clamped to it.
    /// Fails with `Cancelled` when criteria change or the cache is reset
    /// before the range is complete.
    pub async fn ensure_range(&self, start: u64, end: u64) -> Result<RowWindow> {
        self.request(|reply| Command::EnsureRange {
            start,
            end,
            revalidate: false,
            reply,
        })
        .await?
    }

    /// Revalidate the chunks covering `[start, end]` using their stored etags.
    pub async fn refresh_range(&self, start: u64, end: u64) -> Result<RowWindow> {
        self.request(|reply| Command::EnsureRange {
            start,
            end,
            revalidate: true,
            reply,
        })
        .await?
    }

    /// Replace filters and sort order. Anything cached under the old criteria is dropped.
    pub async fn set_criteria(&self, criteria: Criteria) -> Result<()> {
        self.request(|reply| Command::SetCriteria { criteria, reply }).await
    }

    /// Drop the chunks holding rows that were mutated upstream.
    pub async fn invalidate_rows(&self, rows: impl IntoIterator<Item = u64>) -> Result<()> {
        let rows: Vec<u64> = rows.into_iter().collect();
        self.request(|reply| Command::InvalidateRows { rows, reply }).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| GridError::Cancelled)?;
        reply_rx.await.map_err(|_| GridError::Cancelled)
    }
}

struct CacheActor {
    service: Arc<dyn RowRangeService>,
    table: String,
    chunk_size: u64,
    max_cached_chunks: usize,
    frequency_weight_ms: u64,
    chunks: HashMap<ChunkKey, CachedChunk>,
    /// Resident keys, least recently used first.
    access_order: VecDeque<ChunkKey>,
    inflight: HashMap<ChunkKey, InflightFetch>,
    waiters: Vec<Waiter>,
    criteria: Criteria,
    columns: Vec<ColumnInfo>,
    reported_row_count: Option<u64>,
    highest_seen: Option<u64>,
    epoch: u64,
    epoch_token: CancellationToken,
    next_fetch_id: u64,
    stats: CacheStats,
    done_tx: mpsc::UnboundedSender<FetchDone>,
}

impl CacheActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<FetchDone>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(done) = completions.recv() => self.handle_fetch_done(done),
            }
        }

        self.epoch_token.cancel();
        debug!("All handles dropped, window cache stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::EnsureRange {
                start,
                end,
                revalidate,
                reply,
            } => self.ensure_range(start, end, revalidate, reply),
            Command::SetCriteria { criteria, reply } => {
                if criteria == self.criteria {
                    debug!("Criteria unchanged");
                } else {
                    self.criteria = criteria;
                    self.begin_epoch("criteria changed");
                }
                let _ = reply.send(());
            },
            Command::InvalidateRows { rows, reply } => {
                self.invalidate_rows(&rows);
                let _ = reply.send(());
            },
            Command::Reset { reply } => {
                self.columns.clear();
                self.begin_epoch("reset");
                let _ = reply.send(());
            },
            Command::Stats { reply } => {
                let _ = reply.send(CacheStats {
                    cached_chunks: self.chunks.len(),
                    inflight: self.inflight.len(),
                    ..self.stats
                });
            },
        }
    }

    fn ensure_range(
        &mut self,
        start: u64,
        end: u64,
        revalidate: bool,
        reply: oneshot::Sender<Result<RowWindow>>,
    ) {
        let (start, end) = (start.min(end), start.max(end));

        let end = match self.reported_row_count {
            Some(count) if start >= count => {
                let _ = reply.send(Ok(self.window(start, end, &BTreeMap::new())));
                return;
            },
            Some(count) => end.min(count - 1),
            None => end,
        };

        let span = chunk_span(start, end, self.chunk_size);
        let span_len = span.end() - span.start() + 1;
        if span_len > self.max_cached_chunks as u64 {
            let _ = reply.send(Err(GridError::config(format!(
                "range {start}..={end} spans {span_len} chunks, the cache holds at most {}",
                self.max_cached_chunks
            ))));
            return;
        }

        let now = Instant::now();
        let mut waiter = Waiter {
            start,
            end,
            pending: HashSet::new(),
            captured: BTreeMap::new(),
            reply,
        };

        for key in span {
            if !revalidate {
                if let Some(rows) = self.touch(key, now) {
                    self.stats.hits += 1;
                    waiter.captured.insert(key, rows);
                    continue;
                }
            }

            waiter.pending.insert(key);
            if !self.inflight.contains_key(&key) {
                let etag = if revalidate {
                    self.chunks.get(&key).and_then(|c| c.etag.clone())
                } else {
                    None
                };
                self.dispatch(key, etag);
            }
        }

        if waiter.pending.is_empty() {
            self.complete(waiter);
        } else {
            trace!(start, end, pending = waiter.pending.len(), "Range waiting on fetches");
            self.waiters.push(waiter);
        }
    }

    fn dispatch(&mut self, key: ChunkKey, etag: Option<String>) {
        let fetch_id = self.next_fetch_id;
        self.next_fetch_id += 1;

        let token = self.epoch_token.child_token();
        let request = RowRangeRequest {
            table: self.table.clone(),
            offset: chunk_offset(key, self.chunk_size),
            limit: self.chunk_size,
            filters: self.criteria.filters.clone(),
            sort: self.criteria.sort.clone(),
        };
        let service = Arc::clone(&self.service);
        let done_tx = self.done_tx.clone();
        let epoch = self.epoch;
        let task_token = token.clone();

        debug!(key, fetch_id, conditional = etag.is_some(), "Fetching chunk");

        tokio::spawn(
            async move {
                let outcome = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => Err(GridError::Cancelled),
                    outcome = service.fetch_range(&request, etag.as_deref()) => outcome,
                };

                // The actor is gone once every handle is dropped.
                let _ = done_tx.send(FetchDone {
                    key,
                    fetch_id,
                    epoch,
                    outcome,
                });
            }
            .instrument(info_span!("fetch_chunk", key, fetch_id, epoch)),
        );

        self.stats.fetches_issued += 1;
        self.inflight.insert(key, InflightFetch { fetch_id, token });
    }

    fn handle_fetch_done(&mut self, done: FetchDone) {
        let FetchDone {
            key,
            fetch_id,
            epoch,
            outcome,
        } = done;

        if epoch != self.epoch {
            trace!(key, fetch_id, epoch, "Discarding fetch from a previous epoch");
            return;
        }

        match self.inflight.get(&key) {
            Some(fetch) if fetch.fetch_id == fetch_id => {
                self.inflight.remove(&key);
            },
            _ => {
                trace!(key, fetch_id, "Discarding superseded fetch");
                return;
            },
        }

        match outcome {
            Ok(FetchOutcome::Page { page, etag }) => {
                if !page.columns.is_empty() {
                    self.columns = page.columns;
                }
                if let Some(count) = page.row_count {
                    if self.reported_row_count != Some(count) {
                        debug!(row_count = count, "Row count reported");
                    }
                    self.reported_row_count = Some(count);
                }
                self.store(key, page.rows, etag);
                self.deliver(key);
            },
            Ok(FetchOutcome::NotModified) => {
                let now = Instant::now();
                if let Some(chunk) = self.chunks.get_mut(&key) {
                    chunk.last_access = now;
                    self.mark_recent(key);
                    self.stats.not_modified += 1;
                    self.deliver(key);
                } else if self.waiters.iter().any(|w| w.pending.contains(&key)) {
                    debug!(key, "Revalidated chunk was evicted, fetching it again");
                    self.dispatch(key, None);
                } else {
                    trace!(key, "Revalidated chunk was evicted with no one waiting");
                }
            },
            Err(err) => {
                if err.is_cancelled() {
                    debug!(key, "Chunk fetch cancelled");
                } else {
                    warn!(key, error = %err, "Chunk fetch failed");
                }
                self.fail_waiters(key, err);
            },
        }
    }

    fn store(&mut self, key: ChunkKey, mut rows: Vec<Row>, etag: Option<String>) {
        let limit = usize::try_from(self.chunk_size).unwrap_or(usize::MAX);
        if rows.len() > limit {
            warn!(key, returned = rows.len(), limit, "Service returned more rows than requested");
            rows.truncate(limit);
        }

        if let Some(last) = (rows.len() as u64).checked_sub(1) {
            let last = chunk_offset(key, self.chunk_size) + last;
            self.highest_seen = Some(self.highest_seen.map_or(last, |h| h.max(last)));
        }

        let now = Instant::now();
        if let Some(chunk) = self.chunks.get_mut(&key) {
            let access_count = chunk.access_count;
            *chunk = CachedChunk::new(rows, etag, now);
            chunk.access_count = access_count.saturating_add(1);
            self.mark_recent(key);
            return;
        }

        while self.chunks.len() >= self.max_cached_chunks {
            if !self.evict_one(now) {
                break;
            }
        }

        self.chunks.insert(key, CachedChunk::new(rows, etag, now));
        self.access_order.push_back(key);
    }

    /// Evict the lowest-scoring chunk, sparing chunks with a fetch in flight when possible.
    fn evict_one(&mut self, now: Instant) -> bool {
        let candidates: Vec<Candidate> = self
            .access_order
            .iter()
            .enumerate()
            .filter_map(|(recency_rank, key)| {
                self.chunks.get(key).map(|chunk| Candidate {
                    key: *key,
                    access_count: chunk.access_count,
                    idle: now.saturating_duration_since(chunk.last_access),
                    recency_rank,
                })
            })
            .collect();

        let unpinned = candidates
            .iter()
            .copied()
            .filter(|c| !self.inflight.contains_key(&c.key));

        let victim = select_victim(unpinned, self.frequency_weight_ms)
            .or_else(|| select_victim(candidates.iter().copied(), self.frequency_weight_ms));

        let Some(victim) = victim else {
            return false;
        };

        self.chunks.remove(&victim);
        self.access_order.retain(|k| *k != victim);
        self.stats.evictions += 1;
        debug!(key = victim, "Evicted chunk");
        true
    }

    fn touch(&mut self, key: ChunkKey, now: Instant) -> Option<Arc<Vec<Row>>> {
        let chunk = self.chunks.get_mut(&key)?;
        chunk.touch(now);
        let rows = Arc::clone(&chunk.rows);
        self.mark_recent(key);
        Some(rows)
    }

    fn mark_recent(&mut self, key: ChunkKey) {
        if let Some(pos) = self.access_order.iter().position(|k| *k == key) {
            self.access_order.remove(pos);
        }
        self.access_order.push_back(key);
    }

    /// Hand a freshly resident chunk to every waiter that needs it.
    fn deliver(&mut self, key: ChunkKey) {
        let Some(rows) = self.chunks.get(&key).map(|c| Arc::clone(&c.rows)) else {
            error!(key, "Delivered chunk is not resident");
            self.fail_waiters(
                key,
                GridError::inconsistency(format!("chunk {key} missing after store")),
            );
            return;
        };

        let mut still_waiting = Vec::with_capacity(self.waiters.len());
        for mut waiter in std::mem::take(&mut self.waiters) {
            if waiter.pending.remove(&key) {
                waiter.captured.insert(key, Arc::clone(&rows));
            }
            if waiter.pending.is_empty() {
                self.complete(waiter);
            } else {
                still_waiting.push(waiter);
            }
        }
        self.waiters = still_waiting;
    }

    fn fail_waiters(&mut self, key: ChunkKey, err: GridError) {
        let (failed, still_waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.pending.contains(&key));
        self.waiters = still_waiting;

        for waiter in failed {
            let _ = waiter.reply.send(Err(err.clone()));
        }
    }

    fn invalidate_rows(&mut self, rows: &[u64]) {
        let keys: BTreeSet<ChunkKey> = rows.iter().map(|r| chunk_key(*r, self.chunk_size)).collect();

        for key in keys {
            let dropped = self.chunks.remove(&key).is_some();
            if dropped {
                self.access_order.retain(|k| *k != key);
            }

            // A fetch dispatched before the mutation can carry the old rows.
            let stale = self.inflight.remove(&key);
            if let Some(fetch) = &stale {
                fetch.token.cancel();
            }

            let mut needed = false;
            for waiter in &mut self.waiters {
                if waiter.captured.remove(&key).is_some() {
                    waiter.pending.insert(key);
                }
                needed |= waiter.pending.contains(&key);
            }
            if needed {
                self.dispatch(key, None);
            }

            debug!(key, dropped, cancelled_fetch = stale.is_some(), refetch = needed, "Invalidated chunk");
        }
    }

    /// Drop all chunks, cancel every fetch and fail every waiter with `Cancelled`.
    fn begin_epoch(&mut self, reason: &'static str) {
        self.epoch_token.cancel();
        self.epoch_token = CancellationToken::new();
        self.epoch += 1;
        self.stats.epoch = self.epoch;

        let dropped = self.chunks.len();
        self.chunks.clear();
        self.access_order.clear();
        self.inflight.clear();
        self.reported_row_count = None;
        self.highest_seen = None;

        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(Err(GridError::Cancelled));
        }

        info!(epoch = self.epoch, reason, dropped_chunks = dropped, "Cache cleared");
    }

    fn complete(&self, waiter: Waiter) {
        let window = self.window(waiter.start, waiter.end, &waiter.captured);
        if waiter.reply.send(Ok(window)).is_err() {
            trace!("Requester went away before its range completed");
        }
    }

    fn window(&self, start: u64, end: u64, captured: &BTreeMap<ChunkKey, Arc<Vec<Row>>>) -> RowWindow {
        let mut rows = Vec::new();
        for (key, chunk_rows) in captured {
            let offset = chunk_offset(*key, self.chunk_size);
            for (i, values) in chunk_rows.iter().enumerate() {
                let index = offset + i as u64;
                if index < start || index > end {
                    continue;
                }
                if self.reported_row_count.is_some_and(|count| index >= count) {
                    continue;
                }
                rows.push(IndexedRow {
                    index,
                    values: values.clone(),
                });
            }
        }

        let (row_count, row_count_known) = match self.reported_row_count {
            Some(count) => (count, true),
            None => {
                let seen = self.highest_seen.map_or(0, |h| h + 1);
                (seen.max(end.saturating_add(1)), false)
            },
        };

        RowWindow {
            rows,
            row_count,
            row_count_known,
            columns: self.columns.clone(),
        }
    }
}
