//! Trait for converting from SQL values to Rust types.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::TypeError;
use crate::json::Json;
use crate::money::Money;
use crate::value::SqlValue;
use crate::vector::Vector;

/// Trait for types that can be read from result cells.
///
/// Non-`Option` targets fail with [`TypeError::UnexpectedNull`] on NULL;
/// wrap the target in `Option` to read NULL as `None`.
pub trait FromSql: Sized {
    /// Convert from a SQL value to this type.
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError>;

    /// Convert from an optional SQL value.
    fn from_sql_nullable(value: &SqlValue) -> Result<Option<Self>, TypeError> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::from_sql(value).map(Some)
        }
    }
}

fn mismatch(expected: &'static str, value: &SqlValue) -> TypeError {
    if value.is_null() {
        TypeError::UnexpectedNull
    } else {
        TypeError::TypeMismatch {
            expected,
            actual: value.type_name().to_owned(),
        }
    }
}

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            other => other
                .as_i64()
                .map(|n| n != 0)
                .ok_or_else(|| mismatch("bool", other)),
        }
    }
}

impl FromSql for u8 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::TinyInt(v) => Ok(*v),
            other => Err(mismatch("u8", other)),
        }
    }
}

impl FromSql for i16 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::SmallInt(v) => Ok(*v),
            SqlValue::TinyInt(v) => Ok(i16::from(*v)),
            other => Err(mismatch("i16", other)),
        }
    }
}

impl FromSql for i32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value.as_i32().ok_or_else(|| mismatch("i32", value))
    }
}

impl FromSql for i64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value.as_i64().ok_or_else(|| mismatch("i64", value))
    }
}

impl FromSql for f32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            other => Err(mismatch("f32", other)),
        }
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value.as_f64().ok_or_else(|| mismatch("f64", value))
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| mismatch("String", value))
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| mismatch("Vec<u8>", value))
    }
}

impl FromSql for Bytes {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Binary(b) => Ok(b.clone()),
            other => Err(mismatch("Bytes", other)),
        }
    }
}

impl FromSql for Uuid {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Uuid(v) => Ok(*v),
            SqlValue::String(s) => s
                .trim()
                .parse()
                .map_err(|e| TypeError::InvalidUuid(format!("{e}"))),
            other => Err(mismatch("Uuid", other)),
        }
    }
}

impl FromSql for Decimal {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Decimal(v) => Ok(*v),
            SqlValue::Money(m) => Ok(m.amount()),
            SqlValue::String(s) => s
                .trim()
                .parse()
                .map_err(|e| TypeError::InvalidDecimal(format!("{e}"))),
            other => other
                .as_i64()
                .map(Decimal::from)
                .ok_or_else(|| mismatch("Decimal", other)),
        }
    }
}

impl FromSql for Money {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Money(m) => Ok(*m),
            SqlValue::Decimal(d) => Ok(Money::new(*d)),
            SqlValue::String(s) => s.parse(),
            other => Err(mismatch("Money", other)),
        }
    }
}

impl FromSql for NaiveDate {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Date(v) => Ok(*v),
            SqlValue::DateTime(v) | SqlValue::LegacyDateTime(v) => Ok(v.date()),
            other => Err(mismatch("NaiveDate", other)),
        }
    }
}

impl FromSql for NaiveTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Time(v) => Ok(*v),
            SqlValue::DateTime(v) | SqlValue::LegacyDateTime(v) => Ok(v.time()),
            other => Err(mismatch("NaiveTime", other)),
        }
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTime(v) | SqlValue::LegacyDateTime(v) => Ok(*v),
            SqlValue::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
            SqlValue::DateTimeOffset(v) => Ok(v.naive_utc()),
            other => Err(mismatch("NaiveDateTime", other)),
        }
    }
}

impl FromSql for DateTime<FixedOffset> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTimeOffset(v) => Ok(*v),
            other => Err(mismatch("DateTime<FixedOffset>", other)),
        }
    }
}

impl FromSql for DateTime<Utc> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTimeOffset(v) => Ok(v.to_utc()),
            SqlValue::DateTime(v) | SqlValue::LegacyDateTime(v) => Ok(v.and_utc()),
            other => Err(mismatch("DateTime<Utc>", other)),
        }
    }
}

impl FromSql for Json {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Json(j) => Ok(j.clone()),
            SqlValue::String(s) => Ok(Json::new(s.clone())),
            other => Err(mismatch("Json", other)),
        }
    }
}

impl FromSql for serde_json::Value {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        Json::from_sql(value)?.to_value()
    }
}

impl FromSql for Vector {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Vector(v) => Ok(v.clone()),
            SqlValue::String(s) => Vector::from_json(s),
            SqlValue::Json(j) => Vector::from_json(j.as_str()),
            other => Err(mismatch("Vector", other)),
        }
    }
}

impl FromSql for SqlValue {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        Ok(value.clone())
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        T::from_sql_nullable(value)
    }
}
