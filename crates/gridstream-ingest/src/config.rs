//! Configuration for ingestion loads
//!
//! Values come from the environment, falling back to the defaults below.

use gridstream_common::{GridError, Result};

use crate::flow::{FlowConfig, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_PAUSE_HIGH_WATER_CELLS};
use crate::parser::{Delimiter, ParseOptions, DEFAULT_BATCH_SIZE};
use crate::source::DEFAULT_READ_CHUNK_BYTES;

/// Ingestion configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Rows per flushed batch
    pub batch_size: usize,
    /// Bytes requested per read from file and reader sources
    pub read_chunk_bytes: usize,
    /// Buffered cells above which a consumer pauses the producer
    pub pause_high_water_cells: usize,
    pub event_channel_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            pause_high_water_cells: DEFAULT_PAUSE_HIGH_WATER_CELLS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    ///
    /// Environment variables:
    /// - `GRIDSTREAM_BATCH_SIZE`
    /// - `GRIDSTREAM_READ_CHUNK_BYTES`
    /// - `GRIDSTREAM_PAUSE_HIGH_WATER_CELLS`
    /// - `GRIDSTREAM_EVENT_CHANNEL_CAPACITY`
    pub fn from_env() -> Result<Self> {
        let config = Self {
            batch_size: env_or("GRIDSTREAM_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            read_chunk_bytes: env_or("GRIDSTREAM_READ_CHUNK_BYTES", DEFAULT_READ_CHUNK_BYTES),
            pause_high_water_cells: env_or(
                "GRIDSTREAM_PAUSE_HIGH_WATER_CELLS",
                DEFAULT_PAUSE_HIGH_WATER_CELLS,
            ),
            event_channel_capacity: env_or(
                "GRIDSTREAM_EVENT_CHANNEL_CAPACITY",
                DEFAULT_EVENT_CHANNEL_CAPACITY,
            ),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(GridError::config("batch_size must be greater than 0"));
        }

        if self.read_chunk_bytes == 0 {
            return Err(GridError::config("read_chunk_bytes must be greater than 0"));
        }

        if self.pause_high_water_cells == 0 {
            return Err(GridError::config(
                "pause_high_water_cells must be greater than 0",
            ));
        }

        if self.event_channel_capacity == 0 {
            return Err(GridError::config(
                "event_channel_capacity must be greater than 0",
            ));
        }

        Ok(())
    }

    pub fn parse_options(&self, delimiter: Delimiter) -> ParseOptions {
        ParseOptions {
            batch_size: self.batch_size,
            total_bytes: None,
            delimiter,
        }
    }

    pub fn flow_config(&self) -> FlowConfig {
        FlowConfig {
            event_channel_capacity: self.event_channel_capacity,
        }
    }
}
