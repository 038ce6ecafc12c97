//! Gridstream Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the Gridstream workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used by both pipelines:
//!
//! - **Error Handling**: the [`GridError`] taxonomy and the [`Result`] alias
//! - **Logging**: tracing subscriber configuration shared by the binaries
//! - **Types**: rows, column descriptors and progress reports
//!
//! # Example
//!
//! ```no_run
//! use gridstream_common::{GridError, Result, Row};
//!
//! fn first_field(row: &Row) -> Result<&str> {
//!     row.first()
//!         .map(String::as_str)
//!         .ok_or_else(|| GridError::malformed("empty row"))
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{GridError, Result};
pub use types::{ColumnInfo, IndexedRow, Progress, Row};
