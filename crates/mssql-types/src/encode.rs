//! Encoding of values into wire payloads.
//!
//! Two entry points exist. [`encode_param`] picks a wire type for an RPC
//! parameter from the value itself and the session's negotiated features.
//! [`encode_for_column`] converts a value to the type of an existing column,
//! as bulk copy requires.

use bytes::Bytes;
use rust_decimal::Decimal;
use tds_protocol::types::{PLP_MARKER, VECTOR_SCALE_FLOAT32};
use tds_protocol::{RpcParam, TypeId, TypeInfo};

use crate::datetime;
use crate::error::TypeError;
use crate::guid;
use crate::money::{Money, encode_money, encode_small_money};
use crate::value::SqlValue;
use crate::vector::{Vector, VectorElementType};

/// Largest non-PLP NVARCHAR/VARBINARY payload.
const MAX_INLINE_BYTES: usize = 8000;

/// Fractional-seconds scale used for time parameters.
const PARAM_TIME_SCALE: u8 = 7;

/// Precision used for decimal parameters.
const PARAM_DECIMAL_PRECISION: u8 = 38;

/// Session features that change how parameters are typed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamContext {
    /// The server acknowledged the JSON feature extension.
    pub json_supported: bool,
    /// Float32 vectors may travel in the native binary form.
    pub vector_native: bool,
}

/// A parameter's type info and payload, ready for an RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedParam {
    /// Wire and declared type.
    pub type_info: TypeInfo,
    /// Payload; `None` is NULL.
    pub value: Option<Bytes>,
}

impl EncodedParam {
    fn new(type_info: TypeInfo, value: impl Into<Bytes>) -> Self {
        Self {
            type_info,
            value: Some(value.into()),
        }
    }

    fn null(type_info: TypeInfo) -> Self {
        Self {
            type_info,
            value: None,
        }
    }

    /// Attach a parameter name.
    #[must_use]
    pub fn into_rpc_param(self, name: impl Into<String>) -> RpcParam {
        RpcParam::new(name, self.type_info, self.value)
    }
}

fn nvarchar_info(byte_len: usize) -> TypeInfo {
    let max_length = if byte_len > MAX_INLINE_BYTES {
        u32::from(PLP_MARKER)
    } else {
        MAX_INLINE_BYTES as u32
    };
    TypeInfo::new(TypeId::NVarChar).with_max_length(max_length)
}

fn nvarchar_max() -> TypeInfo {
    TypeInfo::new(TypeId::NVarChar).with_max_length(u32::from(PLP_MARKER))
}

fn json_info(ctx: &ParamContext) -> TypeInfo {
    let info = nvarchar_max();
    if ctx.json_supported {
        info.declared_as(TypeId::Json)
    } else {
        info
    }
}

fn utf16(text: &str) -> Bytes {
    tds_protocol::codec::encode_utf16(text)
}

/// Encode a value as an RPC parameter.
pub fn encode_param(value: &SqlValue, ctx: &ParamContext) -> Result<EncodedParam, TypeError> {
    let param = match value {
        SqlValue::Null => EncodedParam::null(TypeInfo::new(TypeId::NVarChar).with_max_length(2)),
        SqlValue::TypedNull(id) => EncodedParam::null(null_type_info(*id, ctx)),
        SqlValue::Bool(v) => EncodedParam::new(
            TypeInfo::new(TypeId::BitN).with_max_length(1),
            vec![u8::from(*v)],
        ),
        SqlValue::TinyInt(v) => int_param(1, &[*v]),
        SqlValue::SmallInt(v) => int_param(2, &v.to_le_bytes()),
        SqlValue::Int(v) => int_param(4, &v.to_le_bytes()),
        SqlValue::BigInt(v) => int_param(8, &v.to_le_bytes()),
        SqlValue::Float(v) => EncodedParam::new(
            TypeInfo::new(TypeId::FloatN).with_max_length(4),
            v.to_le_bytes().to_vec(),
        ),
        SqlValue::Double(v) => EncodedParam::new(
            TypeInfo::new(TypeId::FloatN).with_max_length(8),
            v.to_le_bytes().to_vec(),
        ),
        SqlValue::String(s) => {
            let bytes = utf16(s);
            EncodedParam::new(nvarchar_info(bytes.len()), bytes)
        }
        SqlValue::Binary(b) => {
            let max_length = if b.len() > MAX_INLINE_BYTES {
                u32::from(PLP_MARKER)
            } else {
                MAX_INLINE_BYTES as u32
            };
            EncodedParam::new(
                TypeInfo::new(TypeId::BigVarBinary).with_max_length(max_length),
                b.clone(),
            )
        }
        SqlValue::Decimal(d) => {
            let scale = d.scale() as u8;
            let payload = encode_decimal(*d, PARAM_DECIMAL_PRECISION, scale)?;
            EncodedParam::new(
                TypeInfo::new(TypeId::DecimalN)
                    .with_max_length(payload.len() as u32)
                    .with_precision(PARAM_DECIMAL_PRECISION, scale),
                payload,
            )
        }
        SqlValue::Money(m) => EncodedParam::new(
            TypeInfo::new(TypeId::MoneyN).with_max_length(8),
            encode_money(m.to_scaled()?).to_vec(),
        ),
        SqlValue::Uuid(u) => EncodedParam::new(
            TypeInfo::new(TypeId::Guid).with_max_length(16),
            guid::to_wire(u).to_vec(),
        ),
        SqlValue::Date(d) => {
            EncodedParam::new(TypeInfo::new(TypeId::Date), datetime::encode_date(*d)?.to_vec())
        }
        SqlValue::Time(t) => EncodedParam::new(
            TypeInfo::new(TypeId::Time).with_scale(PARAM_TIME_SCALE),
            datetime::encode_time(*t, PARAM_TIME_SCALE),
        ),
        SqlValue::DateTime(dt) => EncodedParam::new(
            TypeInfo::new(TypeId::DateTime2).with_scale(PARAM_TIME_SCALE),
            datetime::encode_datetime2(*dt, PARAM_TIME_SCALE)?,
        ),
        SqlValue::LegacyDateTime(dt) => EncodedParam::new(
            TypeInfo::new(TypeId::DateTimeN).with_max_length(8),
            datetime::encode_datetime(*dt)?.to_vec(),
        ),
        SqlValue::DateTimeOffset(dto) => EncodedParam::new(
            TypeInfo::new(TypeId::DateTimeOffset).with_scale(PARAM_TIME_SCALE),
            datetime::encode_datetimeoffset(*dto, PARAM_TIME_SCALE)?,
        ),
        SqlValue::Json(j) => EncodedParam::new(json_info(ctx), utf16(j.as_str())),
        SqlValue::Xml(x) => EncodedParam::new(TypeInfo::new(TypeId::Xml), utf16(x)),
        SqlValue::Vector(v) => encode_vector_param(v, ctx)?,
    };
    Ok(param)
}

fn int_param(width: u32, bytes: &[u8]) -> EncodedParam {
    EncodedParam::new(
        TypeInfo::new(TypeId::IntN).with_max_length(width),
        bytes.to_vec(),
    )
}

fn encode_vector_param(vector: &Vector, ctx: &ParamContext) -> Result<EncodedParam, TypeError> {
    // float16 has no binary parameter form yet; it always goes as JSON text
    if ctx.vector_native && vector.element_type() == VectorElementType::Float32 {
        let payload = vector.encode()?;
        let info = TypeInfo::new(TypeId::Vector)
            .with_max_length(payload.len() as u32)
            .with_scale(VECTOR_SCALE_FLOAT32);
        return Ok(EncodedParam::new(info, payload));
    }
    Ok(EncodedParam::new(nvarchar_max(), utf16(&vector.to_json()?)))
}

/// Type info for a NULL that should keep the declared type of `id`.
fn null_type_info(id: TypeId, ctx: &ParamContext) -> TypeInfo {
    let sized = |id, len| TypeInfo::new(id).with_max_length(len);
    match id {
        TypeId::Bit | TypeId::BitN => sized(TypeId::BitN, 1),
        TypeId::Int1 => sized(TypeId::IntN, 1),
        TypeId::Int2 => sized(TypeId::IntN, 2),
        TypeId::Int4 | TypeId::IntN => sized(TypeId::IntN, 4),
        TypeId::Int8 => sized(TypeId::IntN, 8),
        TypeId::Float4 => sized(TypeId::FloatN, 4),
        TypeId::Float8 | TypeId::FloatN => sized(TypeId::FloatN, 8),
        TypeId::Money4 => sized(TypeId::MoneyN, 4),
        TypeId::Money | TypeId::MoneyN => sized(TypeId::MoneyN, 8),
        TypeId::DateTime4 => sized(TypeId::DateTimeN, 4),
        TypeId::DateTime | TypeId::DateTimeN => sized(TypeId::DateTimeN, 8),
        TypeId::Guid => sized(TypeId::Guid, 16),
        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
            sized(TypeId::DecimalN, 17).with_precision(PARAM_DECIMAL_PRECISION, 0)
        }
        TypeId::Date => TypeInfo::new(TypeId::Date),
        TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
            TypeInfo::new(id).with_scale(PARAM_TIME_SCALE)
        }
        TypeId::BigVarBinary | TypeId::BigBinary | TypeId::VarBinary | TypeId::Binary => {
            sized(TypeId::BigVarBinary, MAX_INLINE_BYTES as u32)
        }
        TypeId::Image => sized(TypeId::BigVarBinary, u32::from(PLP_MARKER)),
        TypeId::Xml => TypeInfo::new(TypeId::Xml),
        TypeId::Json => json_info(ctx),
        TypeId::Vector => nvarchar_max(),
        _ => sized(TypeId::NVarChar, 2),
    }
}

fn decimal_width(precision: u8) -> usize {
    match precision {
        0..=9 => 4,
        10..=19 => 8,
        20..=28 => 12,
        _ => 16,
    }
}

/// Encode a DECIMAL/NUMERIC payload at the given precision and scale.
///
/// The value is rounded to `scale`; a result needing more than `precision`
/// digits is out of range.
pub fn encode_decimal(value: Decimal, precision: u8, scale: u8) -> Result<Vec<u8>, TypeError> {
    let mut scaled = value;
    scaled.rescale(u32::from(scale));
    if scaled.scale() != u32::from(scale) {
        return Err(TypeError::InvalidDecimal(format!(
            "{value} cannot be represented at scale {scale}"
        )));
    }
    let magnitude = scaled.mantissa().unsigned_abs();
    let limit = 10u128
        .checked_pow(u32::from(precision.min(38)))
        .unwrap_or(u128::MAX);
    if magnitude >= limit {
        return Err(TypeError::OutOfRange {
            target_type: "DECIMAL",
        });
    }
    let width = decimal_width(precision);
    let mut out = Vec::with_capacity(width + 1);
    out.push(u8::from(!scaled.is_sign_negative() || magnitude == 0));
    out.extend_from_slice(&magnitude.to_le_bytes()[..width]);
    Ok(out)
}

fn mismatch(expected: &'static str, value: &SqlValue) -> TypeError {
    TypeError::TypeMismatch {
        expected,
        actual: value.type_name().to_owned(),
    }
}

/// Convert a value to the payload of a column with the given type.
///
/// Used by bulk copy where the column types come from the server. Money
/// columns accept money, decimal, float and string values but reject
/// integers; DATETIME columns use the 1/300 second codec.
pub fn encode_for_column(value: &SqlValue, info: &TypeInfo) -> Result<Option<Bytes>, TypeError> {
    if value.is_null() {
        return Ok(None);
    }

    let width = info
        .type_id
        .fixed_size()
        .unwrap_or(info.max_length as usize);

    let bytes: Vec<u8> = match info.type_id {
        TypeId::Bit | TypeId::BitN => {
            let flag = match value {
                SqlValue::Bool(b) => *b,
                other => other.as_i64().ok_or_else(|| mismatch("BIT", other))? != 0,
            };
            vec![u8::from(flag)]
        }
        TypeId::Int1 | TypeId::Int2 | TypeId::Int4 | TypeId::Int8 | TypeId::IntN => {
            let n = match value {
                SqlValue::Bool(b) => i64::from(*b),
                other => other.as_i64().ok_or_else(|| mismatch("INT", other))?,
            };
            encode_int_width(n, width)?
        }
        TypeId::Float4 | TypeId::Float8 | TypeId::FloatN => {
            let f = value
                .as_f64()
                .or_else(|| value.as_i64().map(|n| n as f64))
                .ok_or_else(|| mismatch("FLOAT", value))?;
            if width == 4 {
                (f as f32).to_le_bytes().to_vec()
            } else {
                f.to_le_bytes().to_vec()
            }
        }
        TypeId::Money | TypeId::Money4 | TypeId::MoneyN => {
            let money = money_from(value)?;
            if width == 4 {
                encode_small_money(money.to_small_scaled()?).to_vec()
            } else {
                encode_money(money.to_scaled()?).to_vec()
            }
        }
        TypeId::DateTime | TypeId::DateTime4 | TypeId::DateTimeN => {
            let dt = match value {
                SqlValue::LegacyDateTime(dt) | SqlValue::DateTime(dt) => *dt,
                SqlValue::Date(d) => d.and_time(chrono::NaiveTime::MIN),
                SqlValue::DateTimeOffset(dto) => dto.naive_utc(),
                other => return Err(mismatch("DATETIME", other)),
            };
            if width == 4 {
                datetime::encode_smalldatetime(dt)?.to_vec()
            } else {
                datetime::encode_datetime(dt)?.to_vec()
            }
        }
        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
            let d = decimal_from(value)?;
            encode_decimal(d, info.precision, info.scale)?
        }
        TypeId::Guid => {
            let uuid = match value {
                SqlValue::Uuid(u) => *u,
                SqlValue::String(s) => uuid::Uuid::parse_str(s.trim())
                    .map_err(|e| TypeError::InvalidUuid(e.to_string()))?,
                SqlValue::Binary(b) => guid::from_wire(b)?,
                other => return Err(mismatch("UNIQUEIDENTIFIER", other)),
            };
            guid::to_wire(&uuid).to_vec()
        }
        TypeId::Char | TypeId::VarChar | TypeId::BigChar | TypeId::BigVarChar | TypeId::Text => {
            let text = value.as_str().ok_or_else(|| mismatch("VARCHAR", value))?;
            encode_varchar(info, text)?
        }
        TypeId::NChar | TypeId::NVarChar | TypeId::NText | TypeId::Xml | TypeId::Json => {
            let text = value.as_str().ok_or_else(|| mismatch("NVARCHAR", value))?;
            utf16(text).to_vec()
        }
        TypeId::Binary
        | TypeId::VarBinary
        | TypeId::BigBinary
        | TypeId::BigVarBinary
        | TypeId::Image => value
            .as_bytes()
            .ok_or_else(|| mismatch("VARBINARY", value))?
            .to_vec(),
        TypeId::Date => match value {
            SqlValue::Date(d) => datetime::encode_date(*d)?.to_vec(),
            SqlValue::DateTime(dt) | SqlValue::LegacyDateTime(dt) => {
                datetime::encode_date(dt.date())?.to_vec()
            }
            other => return Err(mismatch("DATE", other)),
        },
        TypeId::Time => match value {
            SqlValue::Time(t) => datetime::encode_time(*t, info.scale),
            SqlValue::DateTime(dt) | SqlValue::LegacyDateTime(dt) => {
                datetime::encode_time(dt.time(), info.scale)
            }
            other => return Err(mismatch("TIME", other)),
        },
        TypeId::DateTime2 => match value {
            SqlValue::DateTime(dt) | SqlValue::LegacyDateTime(dt) => {
                datetime::encode_datetime2(*dt, info.scale)?
            }
            SqlValue::Date(d) => {
                datetime::encode_datetime2(d.and_time(chrono::NaiveTime::MIN), info.scale)?
            }
            other => return Err(mismatch("DATETIME2", other)),
        },
        TypeId::DateTimeOffset => match value {
            SqlValue::DateTimeOffset(dto) => datetime::encode_datetimeoffset(*dto, info.scale)?,
            SqlValue::DateTime(dt) => {
                datetime::encode_datetimeoffset(dt.and_utc().fixed_offset(), info.scale)?
            }
            other => return Err(mismatch("DATETIMEOFFSET", other)),
        },
        TypeId::Vector => {
            let vector = match value {
                SqlValue::Vector(v) => v.clone(),
                SqlValue::String(s) => Vector::from_json(s)?,
                other => return Err(mismatch("VECTOR", other)),
            };
            check_vector_column(&vector, info)?;
            vector.encode()?.to_vec()
        }
        _ => {
            return Err(TypeError::UnsupportedConversion {
                from: value.type_name().to_owned(),
                to: info.type_name(),
            });
        }
    };
    if is_length_bounded(info) && bytes.len() > info.max_length as usize {
        return Err(TypeError::ValueTooLong {
            length: bytes.len(),
            max: info.max_length as usize,
        });
    }
    Ok(Some(Bytes::from(bytes)))
}

/// Character and binary columns whose declared length caps each value.
fn is_length_bounded(info: &TypeInfo) -> bool {
    matches!(
        info.type_id,
        TypeId::Char
            | TypeId::VarChar
            | TypeId::BigChar
            | TypeId::BigVarChar
            | TypeId::NChar
            | TypeId::NVarChar
            | TypeId::Binary
            | TypeId::VarBinary
            | TypeId::BigBinary
            | TypeId::BigVarBinary
    ) && !info.is_plp()
        && info.max_length > 0
}

fn encode_int_width(n: i64, width: usize) -> Result<Vec<u8>, TypeError> {
    let out_of_range = |target_type| TypeError::OutOfRange { target_type };
    Ok(match width {
        1 => vec![u8::try_from(n).map_err(|_| out_of_range("TINYINT"))?],
        2 => i16::try_from(n)
            .map_err(|_| out_of_range("SMALLINT"))?
            .to_le_bytes()
            .to_vec(),
        4 => i32::try_from(n)
            .map_err(|_| out_of_range("INT"))?
            .to_le_bytes()
            .to_vec(),
        _ => n.to_le_bytes().to_vec(),
    })
}

fn money_from(value: &SqlValue) -> Result<Money, TypeError> {
    match value {
        SqlValue::Money(m) => Ok(*m),
        SqlValue::Decimal(d) => Ok(Money::new(*d)),
        SqlValue::String(s) => s.parse(),
        SqlValue::Float(_) | SqlValue::Double(_) => {
            let f = value.as_f64().unwrap_or_default();
            Decimal::try_from(f)
                .map(Money::new)
                .map_err(|_| TypeError::OutOfRange {
                    target_type: "MONEY",
                })
        }
        other => Err(mismatch("MONEY", other)),
    }
}

fn decimal_from(value: &SqlValue) -> Result<Decimal, TypeError> {
    match value {
        SqlValue::Decimal(d) => Ok(*d),
        SqlValue::Money(m) => Ok(m.amount()),
        SqlValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| TypeError::InvalidDecimal(s.clone())),
        SqlValue::Float(_) | SqlValue::Double(_) => {
            let f = value.as_f64().unwrap_or_default();
            Decimal::try_from(f).map_err(|e| TypeError::InvalidDecimal(e.to_string()))
        }
        other => other
            .as_i64()
            .map(Decimal::from)
            .ok_or_else(|| mismatch("DECIMAL", other)),
    }
}

fn check_vector_column(vector: &Vector, info: &TypeInfo) -> Result<(), TypeError> {
    if vector.element_type() as u8 != info.scale {
        return Err(TypeError::TypeMismatch {
            expected: "vector element type of the column",
            actual: vector.element_type().name().to_owned(),
        });
    }
    if let Some(dims) = info.vector_dimensions() {
        if dims != vector.dimensions() {
            return Err(TypeError::VectorSizeMismatch {
                expected: dims,
                actual: vector.dimensions(),
            });
        }
    }
    Ok(())
}

fn encode_varchar(info: &TypeInfo, text: &str) -> Result<Vec<u8>, TypeError> {
    #[cfg(feature = "encoding")]
    {
        let encoding = info
            .collation
            .map_or(encoding_rs::WINDOWS_1252, |c| c.encoding());
        let (bytes, _, had_errors) = encoding.encode(text);
        if had_errors {
            return Err(TypeError::InvalidEncoding(format!(
                "{text:?} is not representable in {}",
                encoding.name()
            )));
        }
        Ok(bytes.into_owned())
    }

    #[cfg(not(feature = "encoding"))]
    {
        let _ = info;
        Ok(text.as_bytes().to_vec())
    }
}
