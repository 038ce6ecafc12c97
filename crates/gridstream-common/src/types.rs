//! Common types used across Gridstream

use serde::{Deserialize, Serialize};

/// One delimited record: an ordered sequence of string fields.
///
/// The field count is not required to match the header's.
pub type Row = Vec<String>;

/// A row addressed by its absolute index in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedRow {
    pub index: u64,
    pub values: Row,
}

/// Byte progress of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(loaded: u64, total: Option<u64>) -> Self {
        Self { loaded, total }
    }

    /// Completion percentage, when the total size is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.loaded as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// Column descriptor reported by the row-range service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// SQL type names compared numerically by filters.
const NUMERIC_TYPES: &[&str] = &[
    "TINYINT", "SMALLINT", "INTEGER", "INT", "BIGINT", "HUGEINT", "UTINYINT", "USMALLINT",
    "UINTEGER", "UBIGINT", "FLOAT", "REAL", "DOUBLE", "DECIMAL", "NUMERIC",
];

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    /// Whether filters on this column should use numeric comparison.
    ///
    /// Only the declared type name is consulted, e.g. `DECIMAL(10,2)` or `int4`.
    pub fn is_numeric(&self) -> bool {
        let base: String = self
            .data_type
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        NUMERIC_TYPES.contains(&base.as_str())
    }
}
