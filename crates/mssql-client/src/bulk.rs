//! Bulk copy.
//!
//! A bulk load runs in three requests:
//!
//! 1. `SET FMTONLY ON select * from <table>` to learn the column types,
//! 2. an `insert bulk` statement naming the columns being loaded,
//! 3. a BulkLoad (0x07) message holding COLMETADATA, one ROW per row and a
//!    final DONE.
//!
//! Values are encoded against the server's column types, so a money column
//! accepts `"882342757768.9998"` and a DATETIME column rounds to 1/300 s.
//!
//! ```rust,ignore
//! let result = client
//!     .bulk_insert("dbo.prices", &["id", "price"], &BulkOptions::default(), &[
//!         &[&1i32, &"882342757768.9998"],
//!         &[&2i32, &"-1.25"],
//!     ])
//!     .await?;
//! assert_eq!(result.rows_affected, 2);
//! ```

use bytes::{Bytes, BytesMut};
use mssql_types::{ToSql, encode_for_column};
use tds_protocol::{ColMetaData, ColumnData, Done, RawRow, TokenType};

use crate::error::{Error, Result};
use crate::row::Column;

/// Hints for the `insert bulk` statement.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Check constraints while loading.
    pub check_constraints: bool,
    /// Fire INSERT triggers.
    pub fire_triggers: bool,
    /// Keep NULLs instead of applying column defaults.
    pub keep_nulls: bool,
    /// Take a table lock for the duration of the load.
    pub table_lock: bool,
    /// Expected number of rows, passed as `ROWS_PER_BATCH`.
    pub rows_per_batch: Option<u64>,
    /// Columns the data is sorted by, passed as `ORDER(...)`.
    pub order_hint: Vec<String>,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            check_constraints: false,
            fire_triggers: false,
            keep_nulls: true,
            table_lock: false,
            rows_per_batch: None,
            order_hint: Vec::new(),
        }
    }
}

impl BulkOptions {
    fn hints(&self) -> Vec<String> {
        let mut hints = Vec::new();
        if self.check_constraints {
            hints.push("CHECK_CONSTRAINTS".to_owned());
        }
        if self.fire_triggers {
            hints.push("FIRE_TRIGGERS".to_owned());
        }
        if self.keep_nulls {
            hints.push("KEEP_NULLS".to_owned());
        }
        if self.table_lock {
            hints.push("TABLOCK".to_owned());
        }
        if let Some(rows) = self.rows_per_batch {
            hints.push(format!("ROWS_PER_BATCH = {rows}"));
        }
        if !self.order_hint.is_empty() {
            let order: Vec<String> = self.order_hint.iter().map(|c| quote_name(c)).collect();
            hints.push(format!("ORDER({})", order.join(", ")));
        }
        hints
    }
}

/// Outcome of a bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkInsertResult {
    /// Rows the server reported as copied.
    pub rows_affected: u64,
    /// Rows the client sent.
    pub rows_sent: u64,
}

/// Rows encoded for one bulk load.
#[derive(Debug)]
pub struct BulkCopy {
    table: String,
    metadata: ColMetaData,
    options: BulkOptions,
    rows: BytesMut,
    row_count: u64,
}

impl BulkCopy {
    /// Prepare a load of `columns` (all when empty) into `table`, given the
    /// column descriptions returned for the table.
    pub fn new(
        table: impl Into<String>,
        table_columns: &[Column],
        columns: &[&str],
        options: BulkOptions,
    ) -> Result<Self> {
        let selected: Vec<&Column> = if columns.is_empty() {
            table_columns.iter().collect()
        } else {
            columns
                .iter()
                .map(|name| {
                    table_columns
                        .iter()
                        .find(|c| c.name.eq_ignore_ascii_case(name))
                        .ok_or_else(|| Error::Bulk(format!("column {name} not found")))
                })
                .collect::<Result<_>>()?
        };
        if selected.is_empty() {
            return Err(Error::Bulk("no columns to load".into()));
        }

        let mut metadata = ColMetaData::default();
        for column in selected {
            if column.encrypted {
                return Err(Error::Bulk(format!(
                    "column {} is encrypted; bulk copy of encrypted columns is not supported",
                    column.name
                )));
            }
            let mut data = ColumnData::new(column.name.clone(), column.type_info.clone());
            data.flags.nullable = column.nullable;
            metadata.columns.push(data);
        }

        Ok(Self {
            table: table.into(),
            metadata,
            options,
            rows: BytesMut::new(),
            row_count: 0,
        })
    }

    /// The `insert bulk` statement announcing this load.
    #[must_use]
    pub fn statement(&self) -> String {
        let columns: Vec<String> = self
            .metadata
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_name(&c.name), c.type_info.decl_name()))
            .collect();
        let mut sql = format!("insert bulk {} ({})", self.table, columns.join(", "));
        let hints = self.options.hints();
        if !hints.is_empty() {
            sql.push_str(" with (");
            sql.push_str(&hints.join(", "));
            sql.push(')');
        }
        sql
    }

    /// Encode one row. Values are matched to columns by position.
    pub fn add_row(&mut self, values: &[&(dyn ToSql + Sync)]) -> Result<()> {
        if values.len() != self.metadata.columns.len() {
            return Err(Error::Bulk(format!(
                "row has {} values but {} columns are being loaded",
                values.len(),
                self.metadata.columns.len()
            )));
        }
        let mut raw = RawRow {
            values: Vec::with_capacity(values.len()),
        };
        for (value, column) in values.iter().zip(&self.metadata.columns) {
            let param = |source| Error::Parameter {
                name: column.name.clone(),
                source,
            };
            let value = value.to_sql().map_err(param)?;
            raw.values
                .push(encode_for_column(&value, &column.type_info).map_err(param)?);
        }
        let mut encoded = BytesMut::new();
        raw.encode(&mut encoded, &self.metadata)?;
        self.rows.extend_from_slice(&encoded);
        self.row_count += 1;
        Ok(())
    }

    /// Rows encoded so far.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// The BulkLoad message body: COLMETADATA, the rows, and a final DONE
    /// carrying the row count.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.rows.len() + 256);
        self.metadata.encode(&mut dst, false);
        dst.extend_from_slice(&self.rows);
        Done::final_with_count(Some(self.row_count)).encode(&mut dst, TokenType::Done);
        dst.freeze()
    }
}

/// Bracket-quote an identifier.
fn quote_name(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Query returning the column metadata of `table` without any rows.
pub(crate) fn metadata_query(table: &str) -> String {
    format!("SET FMTONLY ON select * from {table} SET FMTONLY OFF")
}
