//! Column and cell builders for mock result sets.
//!
//! Cells are raw wire values: `None` is NULL, `Some(bytes)` is the value
//! without its length prefix, matching [`RawRow`].

use bytes::Bytes;
use mssql_types::money::encode_money;
use mssql_types::{TypeError, Vector};
use tds_protocol::codec::encode_utf16;
use tds_protocol::{ColMetaData, ColumnData, RawRow, TypeId, TypeInfo};

/// A nullable INT column.
#[must_use]
pub fn int_column(name: &str) -> ColumnData {
    ColumnData::new(name, TypeInfo::new(TypeId::IntN).with_max_length(4))
}

/// A nullable BIGINT column.
#[must_use]
pub fn bigint_column(name: &str) -> ColumnData {
    ColumnData::new(name, TypeInfo::new(TypeId::IntN).with_max_length(8))
}

/// A nullable MONEY column.
#[must_use]
pub fn money_column(name: &str) -> ColumnData {
    ColumnData::new(name, TypeInfo::new(TypeId::MoneyN).with_max_length(8))
}

/// A nullable NVARCHAR(`chars`) column.
#[must_use]
pub fn nvarchar_column(name: &str, chars: u32) -> ColumnData {
    ColumnData::new(name, TypeInfo::new(TypeId::NVarChar).with_max_length(chars * 2))
}

/// A nullable float32 VECTOR(`dimensions`) column.
#[must_use]
pub fn vector_column(name: &str, dimensions: u32) -> ColumnData {
    ColumnData::new(
        name,
        TypeInfo::new(TypeId::Vector)
            .with_max_length(8 + dimensions * 4)
            .with_scale(0),
    )
}

/// COLMETADATA for `columns`.
#[must_use]
pub fn metadata(columns: Vec<ColumnData>) -> ColMetaData {
    ColMetaData {
        columns,
        ..ColMetaData::default()
    }
}

/// A row of raw cells.
#[must_use]
pub fn row(values: Vec<Option<Bytes>>) -> RawRow {
    RawRow { values }
}

/// INT cell.
#[must_use]
pub fn int(value: i32) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(&value.to_le_bytes()))
}

/// BIGINT cell.
#[must_use]
pub fn bigint(value: i64) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(&value.to_le_bytes()))
}

/// MONEY cell holding `scaled` ten-thousandths.
#[must_use]
pub fn money(scaled: i64) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(&encode_money(scaled)))
}

/// NVARCHAR cell.
#[must_use]
pub fn nvarchar(text: &str) -> Option<Bytes> {
    Some(encode_utf16(text))
}

/// Float32 VECTOR cell.
pub fn vector(values: &[f32]) -> Result<Option<Bytes>, TypeError> {
    Vector::new(values.to_vec())?.encode().map(Some)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_column_dimensions() {
        let column = vector_column("embedding", 3);
        assert_eq!(column.type_info.length(), Some(3));
        assert_eq!(column.type_info.decl_name(), "vector(3)");
    }

    #[test]
    fn test_vector_cell_layout() {
        let cell = vector(&[1.0, 2.0, 3.0]).unwrap().unwrap();
        assert_eq!(cell.len(), 8 + 12);
        assert_eq!(u16::from_le_bytes([cell[2], cell[3]]), 3);
    }

    #[test]
    fn test_money_cell_is_high_word_first() {
        let cell = money(1).unwrap();
        assert_eq!(&cell[..], &[0, 0, 0, 0, 1, 0, 0, 0]);
    }
}
