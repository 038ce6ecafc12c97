//! Filter and sort criteria carried by every chunk fetch
//!
//! The cache never evaluates predicates. Criteria are forwarded to the
//! row-range service, and local evaluation, where a caller needs it, goes
//! through [`FilterPredicate`].

use gridstream_common::{ColumnInfo, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    StartsWith,
    IsNull,
    IsNotNull,
}

/// One filter condition on a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterClause {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
    /// Compare as numbers rather than strings.
    #[serde(default)]
    pub numeric: bool,
}

impl FilterClause {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
            numeric: false,
        }
    }

    /// Build a clause whose comparison semantics follow the column's declared type.
    pub fn for_column(column: &ColumnInfo, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            column: column.name.clone(),
            operator,
            value: value.into(),
            numeric: column.is_numeric(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

impl SortKey {
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// Active filters and sort order; a cache epoch is tied to one value of this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Criteria {
    pub filters: Vec<FilterClause>,
    pub sort: Vec<SortKey>,
}

impl Criteria {
    pub fn new(filters: Vec<FilterClause>, sort: Vec<SortKey>) -> Self {
        Self { filters, sort }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.sort.is_empty()
    }
}

/// Evaluates a single filter clause against one cell.
pub trait FilterPredicate: Send + Sync {
    fn matches(&self, clause: &FilterClause, cell: Option<&str>) -> bool;
}

/// True when `row` satisfies every clause, resolving columns by name.
///
/// A clause naming an unknown column, or a row too short to hold it, sees
/// the cell as absent.
pub fn row_matches<P>(predicate: &P, filters: &[FilterClause], columns: &[ColumnInfo], row: &Row) -> bool
where
    P: FilterPredicate + ?Sized,
{
    filters.iter().all(|clause| {
        let cell = columns
            .iter()
            .position(|c| c.name == clause.column)
            .and_then(|i| row.get(i))
            .map(String::as_str);
        predicate.matches(clause, cell)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct Equality;

    impl FilterPredicate for Equality {
        fn matches(&self, clause: &FilterClause, cell: Option<&str>) -> bool {
            match clause.operator {
                FilterOperator::Eq => cell == Some(clause.value.as_str()),
                FilterOperator::IsNull => cell.is_none(),
                _ => true,
            }
        }
    }

    fn row(values: &[&str]) -> Row {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_for_column_uses_declared_type() {
        let price = ColumnInfo::new("price", "DOUBLE");
        let name = ColumnInfo::new("name", "VARCHAR");

        assert!(FilterClause::for_column(&price, FilterOperator::Gt, "10").numeric);
        assert!(!FilterClause::for_column(&name, FilterOperator::Eq, "10").numeric);
    }

    #[test]
    fn test_row_matches_resolves_columns() {
        let columns = vec![ColumnInfo::new("id", "INTEGER"), ColumnInfo::new("city", "VARCHAR")];
        let filters = vec![FilterClause::new("city", FilterOperator::Eq, "Oslo")];

        assert!(row_matches(&Equality, &filters, &columns, &row(&["1", "Oslo"])));
        assert!(!row_matches(&Equality, &filters, &columns, &row(&["2", "Bergen"])));

        let missing = vec![FilterClause::new("country", FilterOperator::IsNull, "")];
        assert!(row_matches(&Equality, &missing, &columns, &row(&["1", "Oslo"])));
    }

    #[test]
    fn test_criteria_wire_format() {
        let criteria = Criteria::new(
            vec![FilterClause::new("n", FilterOperator::StartsWith, "ab")],
            vec![SortKey::descending("n")],
        );
        let json = serde_json::to_value(&criteria).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "filters": [{"column": "n", "operator": "starts_with", "value": "ab", "numeric": false}],
                "sort": [{"column": "n", "descending": true}],
            })
        );
        assert!(!criteria.is_empty());
        assert!(Criteria::default().is_empty());
    }
}
