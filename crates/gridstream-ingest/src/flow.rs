//! Flow-control protocol between the parser task and its consumer
//!
//! The parser runs in its own tokio task and shares no mutable state with
//! the consumer. Everything crosses the boundary as messages:
//!
//! - producer → consumer: [`LoadEvent`] on a bounded channel
//! - consumer → producer: [`FlowSignal`] (`Ack`, `Pause`, `Resume`)
//! - abort: [`LoadHandle::abort`], idempotent
//!
//! Each batch moves through `Sent → AwaitingAck → Acked`. After emitting a
//! batch the producer neither reads input nor emits another batch until that
//! batch is acknowledged, so at most one batch is ever outstanding. While the
//! consumer holds `Pause`, release is withheld even after the ack arrives.
//!
//! ```no_run
//! use gridstream_ingest::flow::{spawn_load, FlowConfig, LoadEvent};
//! use gridstream_ingest::parser::ParseOptions;
//! use gridstream_ingest::source::MemorySource;
//!
//! # async fn run() {
//! let source = MemorySource::new(vec![b"a,b\n1,2\n".to_vec()]);
//! let mut load = spawn_load(source, ParseOptions::default(), FlowConfig::default());
//!
//! while let Some(event) = load.next_event().await {
//!     match event {
//!         LoadEvent::Rows { batch_id, rows } => {
//!             // hand rows to the view, then release the producer
//!             load.ack(batch_id);
//!         },
//!         LoadEvent::Finished(_) => break,
//!         _ => {},
//!     }
//! }
//! # }
//! ```

use async_trait::async_trait;
use gridstream_common::{GridError, Progress, Result, Row};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::parser::{parse_stream, ParseOptions, ParseSummary, RowSink};
use crate::source::ByteSource;

/// Default capacity of the producer → consumer event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 16;

/// Default consumer-side buffer size, in cells, above which it should pause.
pub const DEFAULT_PAUSE_HIGH_WATER_CELLS: usize = 10_000;

/// Message from the parser task to its consumer.
#[derive(Debug)]
pub enum LoadEvent {
    /// The header row; always the first data event.
    Columns(Row),
    /// One batch. Must be acknowledged with `batch_id` before the next one.
    Rows { batch_id: u64, rows: Vec<Row> },
    /// Byte progress. Dropped rather than queued when the channel is full.
    Progress(Progress),
    /// Terminal outcome; always the last event.
    Finished(Result<ParseSummary>),
}

/// Message from the consumer to the parser task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Ack(u64),
    Pause,
    Resume,
}

/// Lifecycle of the outstanding batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Sent,
    AwaitingAck,
    Acked,
}

#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub event_channel_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Consumer's handle on a running load.
pub struct LoadHandle {
    load_id: Uuid,
    events: mpsc::Receiver<LoadEvent>,
    signals: mpsc::UnboundedSender<FlowSignal>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LoadHandle {
    pub fn load_id(&self) -> Uuid {
        self.load_id
    }

    /// Next event, or `None` once the producer is gone and the channel is drained.
    pub async fn next_event(&mut self) -> Option<LoadEvent> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<LoadEvent> {
        self.events.try_recv().ok()
    }

    /// Acknowledge a delivered batch. No effect once the load has settled.
    pub fn ack(&self, batch_id: u64) {
        self.signal(FlowSignal::Ack(batch_id));
    }

    pub fn pause(&self) {
        self.signal(FlowSignal::Pause);
    }

    pub fn resume(&self) {
        self.signal(FlowSignal::Resume);
    }

    pub fn signal(&self, signal: FlowSignal) {
        if self.signals.send(signal).is_err() {
            trace!(load_id = %self.load_id, ?signal, "Signal after load settled, ignored");
        }
    }

    /// Cancel the load. Safe to call repeatedly or after completion.
    pub fn abort(&self) {
        if !self.cancel.is_cancelled() {
            debug!(load_id = %self.load_id, "Aborting load");
        }
        self.cancel.cancel();
    }

    /// True once the producer task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Producer-side sink that forwards parser output over the channels.
struct ChannelSink {
    events: mpsc::Sender<LoadEvent>,
    signals: mpsc::UnboundedReceiver<FlowSignal>,
    cancel: CancellationToken,
    next_batch_id: u64,
    paused: bool,
}

impl ChannelSink {
    async fn send(&self, event: LoadEvent) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GridError::Cancelled),
            sent = self.events.send(event) => sent.map_err(|_| {
                debug!("Consumer dropped its handle");
                GridError::Cancelled
            }),
        }
    }

    /// Wait until `batch_id` is acknowledged and no pause is in force.
    async fn await_release(&mut self, batch_id: u64) -> Result<()> {
        let mut state = BatchState::AwaitingAck;

        loop {
            if state == BatchState::Acked && !self.paused {
                trace!(batch_id, "Batch released");
                return Ok(());
            }

            let signal = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(GridError::Cancelled),
                signal = self.signals.recv() => signal,
            };

            match signal {
                Some(FlowSignal::Ack(id)) if id == batch_id => state = BatchState::Acked,
                Some(FlowSignal::Ack(id)) => {
                    warn!(expected = batch_id, received = id, "Ignoring ack for unknown batch");
                },
                Some(FlowSignal::Pause) => {
                    debug!(batch_id, "Consumer paused");
                    self.paused = true;
                },
                Some(FlowSignal::Resume) => {
                    debug!(batch_id, "Consumer resumed");
                    self.paused = false;
                },
                None => {
                    debug!("Consumer dropped its handle");
                    return Err(GridError::Cancelled);
                },
            }
        }
    }
}

#[async_trait]
impl RowSink for ChannelSink {
    async fn on_columns(&mut self, columns: Row) -> Result<()> {
        self.send(LoadEvent::Columns(columns)).await
    }

    async fn on_rows(&mut self, rows: Vec<Row>) -> Result<()> {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let count = rows.len();
        self.send(LoadEvent::Rows { batch_id, rows }).await?;
        trace!(batch_id, rows = count, state = ?BatchState::Sent, "Batch sent");

        self.await_release(batch_id).await
    }

    fn on_progress(&mut self, progress: Progress) {
        match self.events.try_send(LoadEvent::Progress(progress)) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => trace!(loaded = progress.loaded, "Progress dropped"),
            Err(TrySendError::Closed(_)) => {},
        }
    }
}

/// Spawn a parser task over `source` and return the consumer's handle.
pub fn spawn_load<S>(source: S, options: ParseOptions, config: FlowConfig) -> LoadHandle
where
    S: ByteSource + 'static,
{
    let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let load_id = Uuid::new_v4();

    let mut sink = ChannelSink {
        events: event_tx,
        signals: signal_rx,
        cancel: cancel.clone(),
        next_batch_id: 0,
        paused: false,
    };
    let token = cancel.clone();

    let task = tokio::spawn(
        async move {
            let mut source = source;
            let outcome = parse_stream(&mut source, &mut sink, &options, &token).await;

            match &outcome {
                Ok(summary) => info!(
                    rows = summary.rows,
                    batches = summary.batches,
                    bytes = summary.bytes_loaded,
                    "Load complete"
                ),
                Err(err) if err.is_cancelled() => debug!("Load cancelled"),
                Err(err) => error!(error = %err, "Load failed"),
            }

            // The consumer may already be gone; nothing left to tell it then.
            let _ = sink.events.send(LoadEvent::Finished(outcome)).await;
        }
        .instrument(info_span!("load", %load_id)),
    );

    LoadHandle {
        load_id,
        events: event_rx,
        signals: signal_tx,
        cancel,
        task,
    }
}

/// Consumer-side buffer accounting that decides when to pause the producer.
#[derive(Debug, Clone)]
pub struct BufferWatermark {
    high_water: usize,
    low_water: usize,
    buffered: usize,
    paused: bool,
}

impl BufferWatermark {
    /// Pause above `high_water` cells, resume at or below half of it.
    pub fn new(high_water: usize) -> Self {
        Self::with_low_water(high_water, high_water / 2)
    }

    pub fn with_low_water(high_water: usize, low_water: usize) -> Self {
        Self {
            high_water,
            low_water: low_water.min(high_water),
            buffered: 0,
            paused: false,
        }
    }

    pub fn buffered_cells(&self) -> usize {
        self.buffered
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Record newly buffered cells; returns `Pause` when crossing the high-water mark.
    pub fn add(&mut self, cells: usize) -> Option<FlowSignal> {
        self.buffered = self.buffered.saturating_add(cells);
        if !self.paused && self.buffered > self.high_water {
            self.paused = true;
            return Some(FlowSignal::Pause);
        }
        None
    }

    /// Record drained cells; returns `Resume` when back at the low-water mark.
    pub fn drain(&mut self, cells: usize) -> Option<FlowSignal> {
        self.buffered = self.buffered.saturating_sub(cells);
        if self.paused && self.buffered <= self.low_water {
            self.paused = false;
            return Some(FlowSignal::Resume);
        }
        None
    }
}

impl Default for BufferWatermark {
    fn default() -> Self {
        Self::new(DEFAULT_PAUSE_HIGH_WATER_CELLS)
    }
}

/// Count the cells in a batch.
pub fn cell_count(rows: &[Row]) -> usize {
    rows.iter().map(Vec::len).sum()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_pause_and_resume() {
        let mut mark = BufferWatermark::with_low_water(100, 40);
        assert_eq!(mark.add(60), None);
        assert_eq!(mark.add(50), Some(FlowSignal::Pause));
        assert_eq!(mark.add(10), None, "pause is asserted once");
        assert_eq!(mark.drain(50), None);
        assert_eq!(mark.drain(30), Some(FlowSignal::Resume));
        assert!(!mark.is_paused());
        assert_eq!(mark.buffered_cells(), 40);
    }

    #[test]
    fn test_watermark_default_threshold() {
        let mut mark = BufferWatermark::default();
        assert_eq!(mark.add(DEFAULT_PAUSE_HIGH_WATER_CELLS), None);
        assert_eq!(mark.add(1), Some(FlowSignal::Pause));
        assert_eq!(mark.drain(DEFAULT_PAUSE_HIGH_WATER_CELLS), Some(FlowSignal::Resume));
    }

    #[test]
    fn test_cell_count() {
        let rows = vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]];
        assert_eq!(cell_count(&rows), 3);
    }
}
