//! Buffered results of one request.

use std::sync::Arc;

use mssql_types::{FromSql, SqlValue, TypeError};
use tds_protocol::ServerMessage;

use crate::row::{Column, Row};

/// One result set: the columns from a COLMETADATA token and the rows that
/// followed it.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: Arc<[Column]>,
    rows: Vec<Row>,
}

impl ResultSet {
    pub(crate) fn new(columns: Arc<[Column]>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, values: Vec<SqlValue>) {
        self.rows.push(Row::new(Arc::clone(&self.columns), values));
    }

    /// Column descriptions.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Rows in server order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consume the set, returning its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were returned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// An output parameter of a procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputParam {
    /// Parameter name including the `@`.
    pub name: String,
    /// Ordinal in the call.
    pub ordinal: u16,
    /// Returned value.
    pub value: SqlValue,
}

/// Everything a request produced.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub(crate) result_sets: Vec<ResultSet>,
    pub(crate) rows_affected: u64,
    pub(crate) return_status: Option<i32>,
    pub(crate) output_params: Vec<OutputParam>,
    pub(crate) messages: Vec<ServerMessage>,
}

impl QueryResult {
    /// Result sets in server order.
    #[must_use]
    pub fn result_sets(&self) -> &[ResultSet] {
        &self.result_sets
    }

    /// Consume the result, returning its result sets.
    #[must_use]
    pub fn into_result_sets(self) -> Vec<ResultSet> {
        self.result_sets
    }

    /// Rows of the first result set, or nothing when there was none.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        self.result_sets.first().map_or(&[], ResultSet::rows)
    }

    /// Consume the result, returning the rows of the first result set.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.result_sets
            .into_iter()
            .next()
            .map(ResultSet::into_rows)
            .unwrap_or_default()
    }

    /// First column of the first row, converted.
    ///
    /// Returns `None` when no row came back.
    pub fn scalar<T: FromSql>(&self) -> Result<Option<T>, TypeError> {
        self.rows().first().map(|row| row.get(0)).transpose()
    }

    /// Sum of the row counts reported by DONE tokens that carried one.
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Procedure return status.
    #[must_use]
    pub fn return_status(&self) -> Option<i32> {
        self.return_status
    }

    /// Output parameters in the order the server sent them.
    #[must_use]
    pub fn output_params(&self) -> &[OutputParam] {
        &self.output_params
    }

    /// Output parameter by name, with or without the `@`.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&SqlValue> {
        let name = name.trim_start_matches('@');
        self.output_params
            .iter()
            .find(|p| p.name.trim_start_matches('@').eq_ignore_ascii_case(name))
            .map(|p| &p.value)
    }

    /// INFO messages, such as PRINT output.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{ColumnData, TypeId, TypeInfo};

    fn int_set(values: &[i32]) -> ResultSet {
        let columns: Arc<[Column]> =
            vec![Column::from_metadata(0, &ColumnData::new("n", TypeInfo::new(TypeId::Int4)))].into();
        let mut set = ResultSet::new(columns);
        for v in values {
            set.push(vec![SqlValue::Int(*v)]);
        }
        set
    }

    #[test]
    fn test_scalar_and_rows() {
        let result = QueryResult {
            result_sets: vec![int_set(&[42, 7]), int_set(&[1])],
            ..Default::default()
        };
        assert_eq!(result.scalar::<i32>().unwrap(), Some(42));
        assert_eq!(result.rows().len(), 2);
        assert_eq!(result.result_sets()[1].len(), 1);
        assert_eq!(result.into_rows().len(), 2);
    }

    #[test]
    fn test_empty_result() {
        let result = QueryResult::default();
        assert!(result.rows().is_empty());
        assert_eq!(result.scalar::<i32>().unwrap(), None);
        assert_eq!(result.rows_affected(), 0);
    }

    #[test]
    fn test_output_lookup_ignores_at_sign() {
        let result = QueryResult {
            output_params: vec![OutputParam {
                name: "@Total".into(),
                ordinal: 1,
                value: SqlValue::BigInt(9),
            }],
            ..Default::default()
        };
        assert_eq!(result.output("total"), Some(&SqlValue::BigInt(9)));
        assert_eq!(result.output("@TOTAL"), Some(&SqlValue::BigInt(9)));
        assert!(result.output("other").is_none());
    }
}
