//! Gridstream Window Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Bounded-memory random access into a table that lives on a remote
//! row-range service. Rows are fetched in fixed-size chunks, cached under a
//! frequency-weighted eviction policy and assembled into the requested range.
//!
//! # Modules
//!
//! - [`cache`]: the [`WindowCache`] actor and its operations
//! - [`service`]: the [`RowRangeService`] trait and its HTTP client
//! - [`criteria`]: filters and sort keys forwarded with every fetch
//! - [`chunk`], [`eviction`]: chunk addressing and the eviction score
//! - [`config`]: environment-driven settings
//!
//! # Example
//!
//! ```no_run
//! use gridstream_window::{CacheConfig, HttpRowRangeService, WindowCache};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::from_env()?;
//!     let service = Arc::new(HttpRowRangeService::from_config(&config)?);
//!     let cache = WindowCache::spawn(service, "trips", &config);
//!
//!     let window = cache.ensure_range(0, 99).await?;
//!     println!("{} of {} rows", window.rows.len(), window.row_count);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod chunk;
pub mod config;
pub mod criteria;
pub mod eviction;
pub mod service;

pub use cache::{CacheStats, RowWindow, WindowCache};
pub use chunk::ChunkKey;
pub use config::CacheConfig;
pub use criteria::{Criteria, FilterClause, FilterOperator, FilterPredicate, SortKey};
pub use service::{FetchOutcome, HttpRowRangeService, RowRangePage, RowRangeRequest, RowRangeService};
