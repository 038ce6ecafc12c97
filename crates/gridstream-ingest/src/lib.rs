//! Gridstream Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental parsing of delimited text from files and HTTP bodies, with a
//! flow-control protocol so a slow consumer never causes unbounded buffering.
//!
//! # Modules
//!
//! - [`decode`]: UTF-8 decoding across chunk boundaries
//! - [`parser`]: record scanning, field splitting, [`parser::parse_stream`]
//! - [`source`]: memory, reader/file and HTTP byte sources
//! - [`flow`]: the parser task and its ack/pause/abort protocol
//! - [`config`]: environment-driven settings
//!
//! # Example
//!
//! ```no_run
//! use gridstream_ingest::parser::{parse_stream, CollectingSink, ParseOptions};
//! use gridstream_ingest::source::FileSource;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut source = FileSource::open("./data/table.csv", 64 * 1024).await?;
//!     let mut sink = CollectingSink::default();
//!     let summary = parse_stream(
//!         &mut source,
//!         &mut sink,
//!         &ParseOptions::default(),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//!     println!("{} rows", summary.rows);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod decode;
pub mod flow;
pub mod parser;
pub mod source;

pub use config::IngestConfig;
pub use flow::{spawn_load, BufferWatermark, FlowConfig, FlowSignal, LoadEvent, LoadHandle};
pub use parser::{parse_line, parse_stream, Delimiter, ParseOptions, ParseSummary, RowSink};
pub use source::{ByteSource, FileSource, HttpSource, MemorySource, ReaderSource};
