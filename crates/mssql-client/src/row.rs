//! Rows and column descriptions.
//!
//! Cells are decoded once when the ROW token is read, so a [`Row`] owns
//! plain [`SqlValue`]s and shares its column list with every other row of
//! the same result set.

use std::sync::Arc;

use mssql_types::{FromSql, SqlValue, TypeError};
use tds_protocol::{ColumnData, TypeInfo};

/// A result set column.
///
/// For encrypted columns the type is the plaintext type, since that is the
/// type of the values the caller sees.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Column {
    /// Column name, empty for unnamed expressions.
    pub name: String,
    /// Position in the result set.
    pub index: usize,
    /// Type descriptor.
    pub type_info: TypeInfo,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Whether values arrive encrypted.
    pub encrypted: bool,
}

impl Column {
    /// Describe the column at `index` of a COLMETADATA token.
    #[must_use]
    pub fn from_metadata(index: usize, data: &ColumnData) -> Self {
        let type_info = data
            .crypto
            .as_ref()
            .map_or_else(|| data.type_info.clone(), |c| c.base_type.clone());
        Self {
            name: data.name.clone(),
            index,
            type_info,
            nullable: data.is_nullable(),
            encrypted: data.is_encrypted(),
        }
    }

    /// Upper-case type name, e.g. `NVARCHAR` or `VECTOR`.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_info.type_name()
    }

    /// Declaration, e.g. `nvarchar(max)` or `vector(3)`.
    #[must_use]
    pub fn decl_name(&self) -> String {
        self.type_info.decl_name()
    }

    /// Length in characters, bytes or dimensions, when the type has one.
    #[must_use]
    pub fn length(&self) -> Option<i64> {
        self.type_info.length()
    }

    /// Precision and scale for decimal types.
    #[must_use]
    pub fn precision_scale(&self) -> Option<(u8, u8)> {
        self.type_info.precision_scale()
    }
}

/// A decoded row.
#[derive(Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Column]>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Convert the cell at `index`.
    pub fn get<T: FromSql>(&self, index: usize) -> Result<T, TypeError> {
        let value = self.values.get(index).ok_or(TypeError::OutOfRange {
            target_type: "column index",
        })?;
        T::from_sql(value)
    }

    /// Convert the cell of the first column named `name`.
    ///
    /// Names compare case-insensitively, as SQL Server does by default.
    pub fn get_by_name<T: FromSql>(&self, name: &str) -> Result<T, TypeError> {
        let index = self.position(name).ok_or(TypeError::OutOfRange {
            target_type: "column name",
        })?;
        self.get(index)
    }

    /// Convert, mapping any failure to `None`.
    pub fn try_get<T: FromSql>(&self, index: usize) -> Option<T> {
        self.get(index).ok()
    }

    /// The raw value at `index`.
    #[must_use]
    pub fn get_raw(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Whether the cell at `index` is NULL. Out-of-range indexes are NULL.
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        self.values.get(index).is_none_or(SqlValue::is_null)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column descriptions.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Consume the row, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.entry(&column.name, value);
        }
        map.finish()
    }
}
