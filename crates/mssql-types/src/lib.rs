//! # mssql-types
//!
//! Value codecs between SQL Server wire payloads and Rust types.
//!
//! The framing of a value (length prefixes, PLP chunks) is handled by
//! `tds-protocol`; this crate turns the framed payload into a [`SqlValue`]
//! and back.
//!
//! ## Type Mappings
//!
//! | SQL Server Type | Rust Type |
//! |-----------------|-----------|
//! | `BIT` | `bool` |
//! | `TINYINT` | `u8` |
//! | `SMALLINT` | `i16` |
//! | `INT` | `i32` |
//! | `BIGINT` | `i64` |
//! | `REAL` | `f32` |
//! | `FLOAT` | `f64` |
//! | `DECIMAL`/`NUMERIC` | `rust_decimal::Decimal` |
//! | `MONEY`/`SMALLMONEY` | [`Money`] |
//! | `CHAR`/`VARCHAR`/`NCHAR`/`NVARCHAR` | `String` |
//! | `DATE` | `chrono::NaiveDate` |
//! | `TIME` | `chrono::NaiveTime` |
//! | `DATETIME`/`SMALLDATETIME`/`DATETIME2` | `chrono::NaiveDateTime` |
//! | `DATETIMEOFFSET` | `chrono::DateTime<FixedOffset>` |
//! | `UNIQUEIDENTIFIER` | `uuid::Uuid` |
//! | `JSON` | [`Json`], `serde_json::Value` |
//! | `VECTOR` | [`Vector`] |
//!
//! NULL maps to `Option::None` in both directions.
//!
//! ```
//! use mssql_types::{FromSql, SqlValue, ToSql, Vector};
//!
//! let v = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
//! let bytes = v.encode().unwrap();
//! let back = Vector::decode(Some(&bytes)).unwrap().unwrap();
//! assert_eq!(back.values(), &[1.0, 2.0, 3.0]);
//!
//! let cell = Some(42i32).to_sql().unwrap();
//! assert_eq!(Option::<i32>::from_sql(&cell).unwrap(), Some(42));
//! assert_eq!(Option::<i32>::from_sql(&SqlValue::Null).unwrap(), None);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod datetime;
pub mod decode;
pub mod encode;
pub mod error;
pub mod from_sql;
pub mod guid;
pub mod json;
pub mod money;
pub mod to_sql;
pub mod value;
pub mod vector;

pub use decode::{decode_utf16_string, decode_value};
pub use encode::{EncodedParam, ParamContext, encode_for_column, encode_param};
pub use error::TypeError;
pub use from_sql::FromSql;
pub use json::Json;
pub use money::Money;
pub use to_sql::ToSql;
pub use value::SqlValue;
pub use vector::{
    PrecisionLossHandler, Vector, VectorElementType, clear_precision_loss_handler,
    set_precision_loss_handler, set_precision_warnings,
};
