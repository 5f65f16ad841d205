//! Cell decoding.
//!
//! The length framing (fixed, byte/ushort/long prefixes, text pointers, PLP
//! chunks) is stripped by `tds_protocol::value::read_value`; the functions
//! here only see the value payload and interpret it according to the
//! column's [`TypeInfo`].

use rust_decimal::Decimal;
use tds_protocol::{TypeId, TypeInfo};

use crate::datetime;
use crate::error::{TypeError, expect_len};
use crate::guid;
use crate::json::Json;
use crate::money::{Money, decode_money, decode_small_money};
use crate::value::SqlValue;
use crate::vector::Vector;

/// Decode a value payload. `None` is SQL NULL.
pub fn decode_value(info: &TypeInfo, data: Option<&[u8]>) -> Result<SqlValue, TypeError> {
    let Some(data) = data else {
        return Ok(SqlValue::Null);
    };

    match info.type_id {
        TypeId::Null => Ok(SqlValue::Null),
        TypeId::Bit | TypeId::BitN => {
            expect_len(data, 1)?;
            Ok(SqlValue::Bool(data[0] != 0))
        }
        TypeId::Int1 | TypeId::Int2 | TypeId::Int4 | TypeId::Int8 | TypeId::IntN => {
            decode_int(data)
        }
        TypeId::Float4 | TypeId::Float8 | TypeId::FloatN => decode_float(data),
        TypeId::Money | TypeId::Money4 | TypeId::MoneyN => decode_money_value(data),
        TypeId::DateTime | TypeId::DateTime4 | TypeId::DateTimeN => match data.len() {
            8 => Ok(SqlValue::LegacyDateTime(datetime::decode_datetime(data)?)),
            4 => Ok(SqlValue::LegacyDateTime(datetime::decode_smalldatetime(data)?)),
            n => Err(TypeError::InvalidDateTime(format!("DATETIME of {n} bytes"))),
        },
        TypeId::Guid => Ok(SqlValue::Uuid(guid::from_wire(data)?)),
        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
            Ok(SqlValue::Decimal(decode_decimal(data, info.scale)?))
        }
        TypeId::Char | TypeId::VarChar | TypeId::BigChar | TypeId::BigVarChar | TypeId::Text => {
            Ok(SqlValue::String(decode_varchar(info, data)?))
        }
        TypeId::NChar | TypeId::NVarChar | TypeId::NText => {
            let text = decode_utf16_string(data)?;
            if info.decl_type_id == TypeId::Json {
                Ok(SqlValue::Json(Json::new(text)))
            } else {
                Ok(SqlValue::String(text))
            }
        }
        TypeId::Binary
        | TypeId::VarBinary
        | TypeId::BigBinary
        | TypeId::BigVarBinary
        | TypeId::Image
        | TypeId::Udt => Ok(SqlValue::Binary(bytes::Bytes::copy_from_slice(data))),
        TypeId::Date => Ok(SqlValue::Date(datetime::decode_date(data)?)),
        TypeId::Time => Ok(SqlValue::Time(datetime::decode_time(data, info.scale)?)),
        TypeId::DateTime2 => Ok(SqlValue::DateTime(datetime::decode_datetime2(
            data, info.scale,
        )?)),
        TypeId::DateTimeOffset => Ok(SqlValue::DateTimeOffset(
            datetime::decode_datetimeoffset(data, info.scale)?,
        )),
        TypeId::Xml => {
            let text = decode_utf16_string(data)?;
            Ok(SqlValue::Xml(
                text.strip_prefix('\u{FEFF}').map(str::to_owned).unwrap_or(text),
            ))
        }
        TypeId::Json => Ok(SqlValue::Json(Json::new(decode_utf16_string(data)?))),
        TypeId::Vector => Ok(Vector::decode(Some(data))?
            .map(SqlValue::Vector)
            .unwrap_or(SqlValue::Null)),
        _ => Err(TypeError::UnsupportedConversion {
            from: info.type_name().into(),
            to: "SqlValue",
        }),
    }
}

fn decode_int(data: &[u8]) -> Result<SqlValue, TypeError> {
    match *data {
        [b] => Ok(SqlValue::TinyInt(b)),
        [a, b] => Ok(SqlValue::SmallInt(i16::from_le_bytes([a, b]))),
        [a, b, c, d] => Ok(SqlValue::Int(i32::from_le_bytes([a, b, c, d]))),
        [a, b, c, d, e, f, g, h] => Ok(SqlValue::BigInt(i64::from_le_bytes([
            a, b, c, d, e, f, g, h,
        ]))),
        _ => Err(TypeError::InvalidBinary(format!(
            "integer of {} bytes",
            data.len()
        ))),
    }
}

fn decode_float(data: &[u8]) -> Result<SqlValue, TypeError> {
    match *data {
        [a, b, c, d] => Ok(SqlValue::Float(f32::from_le_bytes([a, b, c, d]))),
        [a, b, c, d, e, f, g, h] => Ok(SqlValue::Double(f64::from_le_bytes([
            a, b, c, d, e, f, g, h,
        ]))),
        _ => Err(TypeError::InvalidBinary(format!(
            "float of {} bytes",
            data.len()
        ))),
    }
}

fn decode_money_value(data: &[u8]) -> Result<SqlValue, TypeError> {
    let scaled = match data.len() {
        4 => i64::from(decode_small_money(data)?),
        _ => decode_money(data)?,
    };
    Ok(SqlValue::Money(Money::from_scaled(scaled)))
}

/// Decode a DECIMAL/NUMERIC payload: sign byte (1 = positive) then a
/// little-endian magnitude of 4, 8, 12 or 16 bytes.
pub fn decode_decimal(data: &[u8], scale: u8) -> Result<Decimal, TypeError> {
    let (&sign, magnitude) = data
        .split_first()
        .ok_or_else(|| TypeError::InvalidDecimal("empty payload".into()))?;
    if !matches!(magnitude.len(), 4 | 8 | 12 | 16) {
        return Err(TypeError::InvalidDecimal(format!(
            "magnitude of {} bytes",
            magnitude.len()
        )));
    }
    let mut raw = [0u8; 16];
    raw[..magnitude.len()].copy_from_slice(magnitude);
    let magnitude = u128::from_le_bytes(raw);
    let mantissa = i128::try_from(magnitude)
        .map_err(|_| TypeError::InvalidDecimal("magnitude overflows i128".into()))?;
    let mantissa = if sign == 0 { -mantissa } else { mantissa };
    Decimal::try_from_i128_with_scale(mantissa, u32::from(scale))
        .map_err(|e| TypeError::InvalidDecimal(e.to_string()))
}

fn decode_varchar(info: &TypeInfo, data: &[u8]) -> Result<String, TypeError> {
    #[cfg(feature = "encoding")]
    {
        let encoding = info
            .collation
            .map_or(encoding_rs::WINDOWS_1252, |c| c.encoding());
        let (text, had_errors) = encoding.decode_without_bom_handling(data);
        if had_errors {
            return Err(TypeError::InvalidEncoding(format!(
                "invalid {} data",
                encoding.name()
            )));
        }
        Ok(text.into_owned())
    }

    #[cfg(not(feature = "encoding"))]
    {
        let _ = info;
        String::from_utf8(data.to_vec()).map_err(|e| TypeError::InvalidEncoding(e.to_string()))
    }
}

/// Decode a UTF-16LE string from bytes.
pub fn decode_utf16_string(data: &[u8]) -> Result<String, TypeError> {
    tds_protocol::codec::decode_utf16_bytes(data)
        .map_err(|e| TypeError::InvalidEncoding(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_decode_null_for_any_type() {
        let info = TypeInfo::new(TypeId::IntN).with_max_length(4);
        assert_eq!(decode_value(&info, None).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_decode_intn_by_length() {
        let info = TypeInfo::new(TypeId::IntN).with_max_length(8);
        assert_eq!(
            decode_value(&info, Some(&[42, 0, 0, 0])).unwrap(),
            SqlValue::Int(42)
        );
        assert_eq!(
            decode_value(&info, Some(&[0xFF; 8])).unwrap(),
            SqlValue::BigInt(-1)
        );
        assert!(decode_value(&info, Some(&[0; 3])).is_err());
    }

    #[test]
    fn test_decode_nvarchar_and_json_override() {
        let data = [0x41, 0x00, 0x42, 0x00];
        let info = TypeInfo::new(TypeId::NVarChar).with_max_length(100);
        assert_eq!(
            decode_value(&info, Some(&data)).unwrap(),
            SqlValue::String("AB".into())
        );
        let json = info.declared_as(TypeId::Json);
        assert_eq!(
            decode_value(&json, Some(&data)).unwrap(),
            SqlValue::Json(Json::new("AB"))
        );
    }

    #[test]
    fn test_decode_native_json() {
        let info = TypeInfo::new(TypeId::Json).with_max_length(0xFFFF);
        let payload = tds_protocol::codec::encode_utf16(r#"{"k":1}"#);
        assert_eq!(
            decode_value(&info, Some(&payload)).unwrap(),
            SqlValue::Json(Json::new(r#"{"k":1}"#))
        );
    }

    #[test]
    fn test_decode_decimal() {
        // -123.45 at scale 2
        let data = [0, 0x39, 0x30, 0, 0];
        assert_eq!(decode_decimal(&data, 2).unwrap().to_string(), "-123.45");
        assert!(decode_decimal(&[1, 0, 0], 0).is_err());
    }

    #[test]
    fn test_decode_money_both_widths() {
        let info = TypeInfo::new(TypeId::MoneyN).with_max_length(8);
        let wire = crate::money::encode_money(-8_823_427_577_689_998);
        let value = decode_value(&info, Some(&wire)).unwrap();
        assert_eq!(
            value,
            SqlValue::Money(Money::from_scaled(-8_823_427_577_689_998))
        );
        let small = crate::money::encode_small_money(12_345);
        assert_eq!(
            decode_value(&info, Some(&small)).unwrap(),
            SqlValue::Money(Money::from_scaled(12_345))
        );
    }

    #[test]
    fn test_decode_legacy_datetime() {
        let info = TypeInfo::new(TypeId::DateTimeN).with_max_length(8);
        let value = decode_value(&info, Some(&[1, 0, 0, 0, 44, 1, 0, 0])).unwrap();
        let expected = NaiveDate::from_ymd_opt(1900, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap();
        assert_eq!(value, SqlValue::LegacyDateTime(expected));
    }

    #[test]
    fn test_decode_vector_column() {
        let info = TypeInfo::new(TypeId::Vector).with_max_length(20);
        let bytes = Vector::new(vec![1.0, 2.0, 3.0]).unwrap().encode().unwrap();
        let value = decode_value(&info, Some(&bytes)).unwrap();
        assert_eq!(value.as_vector().unwrap().values(), &[1.0, 2.0, 3.0]);
        assert!(matches!(
            decode_value(&info, Some(&[0xA9])),
            Err(TypeError::VectorTruncated(1))
        ));
    }

    #[cfg(feature = "encoding")]
    #[test]
    fn test_decode_varchar_latin1() {
        let info = TypeInfo::new(TypeId::BigVarChar).with_max_length(10);
        assert_eq!(
            decode_value(&info, Some(&[0x63, 0x61, 0x66, 0xE9])).unwrap(),
            SqlValue::String("café".into())
        );
    }
}
