//! Conversions through the public API: Rust value -> SqlValue -> wire
//! payload -> SqlValue -> Rust value.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use mssql_types::{
    FromSql, Json, Money, ParamContext, SqlValue, ToSql, TypeError, Vector, decode_value,
    encode_for_column, encode_param,
};
use tds_protocol::{TypeId, TypeInfo};

fn through_param<T: ToSql>(value: T, ctx: &ParamContext) -> SqlValue {
    let param = encode_param(&value.to_sql().unwrap(), ctx).unwrap();
    decode_value(&param.type_info, param.value.as_deref()).unwrap()
}

// ============================================================================
// NULL handling
// ============================================================================

mod null_handling {
    use super::*;

    #[test]
    fn test_null_to_option() {
        assert_eq!(Option::<i32>::from_sql(&SqlValue::Null).unwrap(), None);
        assert_eq!(Option::<String>::from_sql(&SqlValue::Null).unwrap(), None);
        assert_eq!(Option::<Vector>::from_sql(&SqlValue::Null).unwrap(), None);
    }

    #[test]
    fn test_null_to_non_option_fails() {
        assert!(matches!(
            String::from_sql(&SqlValue::Null),
            Err(TypeError::UnexpectedNull)
        ));
        assert!(matches!(
            Money::from_sql(&SqlValue::TypedNull(TypeId::MoneyN)),
            Err(TypeError::UnexpectedNull)
        ));
    }

    #[test]
    fn test_typed_null_params() {
        let ctx = ParamContext::default();
        let cases: [(SqlValue, &str); 4] = [
            (None::<i64>.to_sql().unwrap(), "bigint"),
            (None::<Money>.to_sql().unwrap(), "money"),
            (None::<NaiveDate>.to_sql().unwrap(), "date"),
            (None::<uuid::Uuid>.to_sql().unwrap(), "uniqueidentifier"),
        ];
        for (value, decl) in cases {
            let param = encode_param(&value, &ctx).unwrap();
            assert_eq!(param.type_info.decl_name(), decl);
            assert!(param.value.is_none());
        }
    }

    #[test]
    fn test_null_param_frames_as_null() {
        let param = encode_param(&SqlValue::Null, &ParamContext::default()).unwrap();
        let rpc = param.into_rpc_param("@p1");
        let mut buf = Vec::new();
        rpc.encode(&mut buf).unwrap();
        // name, flags, type info (0xE7, len 2, collation), NULL length marker
        assert_eq!(&buf[buf.len() - 2..], &[0xFF, 0xFF]);
    }
}

// ============================================================================
// Integer and float boundaries
// ============================================================================

mod numeric_boundaries {
    use super::*;

    #[test]
    fn test_integer_extremes() {
        let ctx = ParamContext::default();
        assert_eq!(through_param(i64::MIN, &ctx), SqlValue::BigInt(i64::MIN));
        assert_eq!(through_param(i32::MAX, &ctx), SqlValue::Int(i32::MAX));
        assert_eq!(through_param(i16::MIN, &ctx), SqlValue::SmallInt(i16::MIN));
        assert_eq!(through_param(255u8, &ctx), SqlValue::TinyInt(255));
    }

    #[test]
    fn test_float_values() {
        let ctx = ParamContext::default();
        assert_eq!(through_param(1.5f32, &ctx), SqlValue::Float(1.5));
        assert_eq!(through_param(-0.25f64, &ctx), SqlValue::Double(-0.25));
    }

    #[test]
    fn test_decimal_scale_preserved() {
        let d: rust_decimal::Decimal = "12345.6789".parse().unwrap();
        let value = through_param(d, &ParamContext::default());
        assert_eq!(rust_decimal::Decimal::from_sql(&value).unwrap(), d);
    }
}

// ============================================================================
// Money
// ============================================================================

mod money {
    use super::*;

    #[test]
    fn test_negative_money_param() {
        let money: Money = "-882342757768.9998".parse().unwrap();
        let value = through_param(money, &ParamContext::default());
        assert_eq!(Money::from_sql(&value).unwrap().to_scaled().unwrap(), -8_823_427_577_689_998);
    }

    #[test]
    fn test_bulk_column_string() {
        let column = TypeInfo::new(TypeId::MoneyN).with_max_length(8);
        let payload = encode_for_column(&SqlValue::from("882342757768.9998"), &column)
            .unwrap()
            .unwrap();
        let value = decode_value(&column, Some(&payload)).unwrap();
        assert_eq!(
            Money::from_sql(&value).unwrap().to_scaled().unwrap(),
            8_823_427_577_689_998
        );
    }

    #[test]
    fn test_small_money_column_range() {
        let column = TypeInfo::new(TypeId::MoneyN).with_max_length(4);
        assert!(encode_for_column(&SqlValue::from("214748.3647"), &column).is_ok());
        assert!(encode_for_column(&SqlValue::from("214748.3648"), &column).is_err());
    }
}

// ============================================================================
// Date and time
// ============================================================================

mod datetime {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32, micros: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_micro_opt(h, mi, s, micros)
            .unwrap()
    }

    #[test]
    fn test_legacy_datetime_column_carries_midnight() {
        let column = TypeInfo::new(TypeId::DateTimeN).with_max_length(8);
        let value = SqlValue::DateTime(at(2025, 6, 30, 23, 59, 59, 998_350));
        let payload = encode_for_column(&value, &column).unwrap().unwrap();
        let decoded = NaiveDateTime::from_sql(&decode_value(&column, Some(&payload)).unwrap());
        assert_eq!(decoded.unwrap(), at(2025, 7, 1, 0, 0, 0, 0));
    }

    #[test]
    fn test_datetime2_param_keeps_precision() {
        let value = at(2024, 2, 29, 12, 0, 0, 123_456);
        let decoded = through_param(value, &ParamContext::default());
        assert_eq!(NaiveDateTime::from_sql(&decoded).unwrap(), value);
    }
}

// ============================================================================
// JSON and vectors
// ============================================================================

mod json_and_vector {
    use super::*;

    #[test]
    fn test_json_param_roundtrip() {
        let ctx = ParamContext {
            json_supported: true,
            vector_native: false,
        };
        let value = through_param(Json::new(r#"{"id":7}"#), &ctx);
        assert_eq!(value, SqlValue::Json(Json::new(r#"{"id":7}"#)));
        let parsed = serde_json::Value::from_sql(&value).unwrap();
        assert_eq!(parsed["id"], 7);
    }

    #[test]
    fn test_vector_native_roundtrip() {
        let ctx = ParamContext {
            json_supported: false,
            vector_native: true,
        };
        let v = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
        let back = Vector::from_sql(&through_param(v, &ctx)).unwrap();
        assert_eq!(back.dimensions(), 3);
        assert_eq!(back.values(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_vector_json_fallback_roundtrip() {
        let v = Vector::new(vec![0.5, f32::NAN]).unwrap();
        let value = through_param(v, &ParamContext::default());
        assert_eq!(value, SqlValue::String("[0.5, null]".into()));
        let back = Vector::from_sql(&value).unwrap();
        assert_eq!(back.values()[0], 0.5);
        assert!(back.values()[1].is_nan());
    }

    #[test]
    fn test_vector_column_rejects_bad_header() {
        let column = TypeInfo::new(TypeId::Vector).with_max_length(12);
        let bad = Bytes::from_static(&[0xA9, 0x02, 1, 0, 0, 0, 0, 0, 0, 0, 0x80, 0x3F]);
        assert!(matches!(
            decode_value(&column, Some(&bad)),
            Err(TypeError::InvalidVectorVersion(0x02))
        ));
    }
}
