//! Trait for converting Rust types to SQL values.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tds_protocol::TypeId;
use uuid::Uuid;

use crate::error::TypeError;
use crate::json::Json;
use crate::money::Money;
use crate::value::SqlValue;
use crate::vector::Vector;

/// Trait for types that can be bound as query parameters.
pub trait ToSql {
    /// Convert this value to a SQL value.
    fn to_sql(&self) -> Result<SqlValue, TypeError>;

    /// Type a `None` of this type is declared with.
    ///
    /// `None` sends an untyped NULL (`nvarchar(1)`).
    fn null_type_id() -> Option<TypeId>
    where
        Self: Sized,
    {
        None
    }
}

macro_rules! impl_to_sql {
    ($($ty:ty => $type_id:expr, |$v:ident| $conv:expr;)*) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> Result<SqlValue, TypeError> {
                    let $v = self;
                    Ok($conv)
                }

                fn null_type_id() -> Option<TypeId> {
                    Some($type_id)
                }
            }
        )*
    };
}

impl_to_sql! {
    bool => TypeId::Bit, |v| SqlValue::Bool(*v);
    u8 => TypeId::Int1, |v| SqlValue::TinyInt(*v);
    i16 => TypeId::Int2, |v| SqlValue::SmallInt(*v);
    i32 => TypeId::Int4, |v| SqlValue::Int(*v);
    i64 => TypeId::Int8, |v| SqlValue::BigInt(*v);
    f32 => TypeId::Float4, |v| SqlValue::Float(*v);
    f64 => TypeId::Float8, |v| SqlValue::Double(*v);
    String => TypeId::NVarChar, |v| SqlValue::String(v.clone());
    Vec<u8> => TypeId::BigVarBinary, |v| SqlValue::Binary(Bytes::copy_from_slice(v));
    Bytes => TypeId::BigVarBinary, |v| SqlValue::Binary(v.clone());
    Decimal => TypeId::DecimalN, |v| SqlValue::Decimal(*v);
    Money => TypeId::MoneyN, |v| SqlValue::Money(*v);
    Uuid => TypeId::Guid, |v| SqlValue::Uuid(*v);
    NaiveDate => TypeId::Date, |v| SqlValue::Date(*v);
    NaiveTime => TypeId::Time, |v| SqlValue::Time(*v);
    NaiveDateTime => TypeId::DateTime2, |v| SqlValue::DateTime(*v);
    DateTime<FixedOffset> => TypeId::DateTimeOffset, |v| SqlValue::DateTimeOffset(*v);
    DateTime<Utc> => TypeId::DateTimeOffset, |v| SqlValue::DateTimeOffset(v.fixed_offset());
    Json => TypeId::Json, |v| SqlValue::Json(v.clone());
    serde_json::Value => TypeId::Json, |v| SqlValue::Json(Json::from(v.clone()));
    Vector => TypeId::Vector, |v| SqlValue::Vector(v.clone());
}

impl ToSql for str {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::String(self.to_owned()))
    }
}

impl ToSql for [u8] {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::Binary(Bytes::copy_from_slice(self)))
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(self.clone())
    }
}

impl<T: ToSql> ToSql for Option<T> {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        match self {
            Some(v) => v.to_sql(),
            None => Ok(T::null_type_id().map_or(SqlValue::Null, SqlValue::TypedNull)),
        }
    }

    fn null_type_id() -> Option<TypeId> {
        T::null_type_id()
    }
}

impl<T: ToSql + ?Sized> ToSql for &T {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        (*self).to_sql()
    }
}
