//! Benchmarks for value codecs.

#![allow(clippy::unwrap_used, missing_docs)]

use chrono::NaiveDate;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use mssql_types::datetime::encode_datetime;
use mssql_types::money::{decode_money, encode_money};
use mssql_types::vector::{f16_to_f32, f32_to_f16};
use mssql_types::{
    ParamContext, SqlValue, Vector, VectorElementType, decode_utf16_string, decode_value,
    encode_param,
};
use std::hint::black_box;
use tds_protocol::{TypeId, TypeInfo};

fn sample_values(n: usize) -> Vec<f32> {
    (0..n).map(|i| (i as f32) * 0.37 - 100.0).collect()
}

/// Vector binary encode/decode at the float32 limit.
fn bench_vector(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector");

    let f32_vec = Vector::new(sample_values(1998)).unwrap();
    let f32_bytes = f32_vec.encode().unwrap();
    group.throughput(Throughput::Bytes(f32_bytes.len() as u64));
    group.bench_function("encode_f32_1998", |b| {
        b.iter(|| black_box(&f32_vec).encode().unwrap())
    });
    group.bench_function("decode_f32_1998", |b| {
        b.iter(|| Vector::decode(Some(black_box(&f32_bytes))).unwrap())
    });

    let f16_vec =
        Vector::with_element_type(VectorElementType::Float16, sample_values(3996)).unwrap();
    let f16_bytes = f16_vec.encode().unwrap();
    group.throughput(Throughput::Bytes(f16_bytes.len() as u64));
    group.bench_function("encode_f16_3996", |b| {
        b.iter(|| black_box(&f16_vec).encode().unwrap())
    });
    group.bench_function("decode_f16_3996", |b| {
        b.iter(|| Vector::decode(Some(black_box(&f16_bytes))).unwrap())
    });

    let small = Vector::new(sample_values(128)).unwrap();
    group.bench_function("to_json_128", |b| {
        b.iter(|| black_box(&small).to_json().unwrap())
    });
    let text = small.to_json().unwrap();
    group.bench_function("from_json_128", |b| {
        b.iter(|| Vector::from_json(black_box(&text)).unwrap())
    });

    group.finish();
}

fn bench_half_precision(c: &mut Criterion) {
    let inputs = sample_values(1024);
    c.bench_function("f16_roundtrip_1024", |b| {
        b.iter(|| {
            inputs
                .iter()
                .map(|&x| f16_to_f32(f32_to_f16(black_box(x))))
                .sum::<f32>()
        })
    });
}

fn bench_fixed_codecs(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed");

    group.bench_function("money_encode_decode", |b| {
        b.iter(|| decode_money(&encode_money(black_box(-8_823_427_577_689_998))).unwrap())
    });

    let dt = NaiveDate::from_ymd_opt(2025, 1, 1)
        .unwrap()
        .and_hms_micro_opt(23, 59, 59, 998_350)
        .unwrap();
    group.bench_function("datetime_encode", |b| {
        b.iter(|| encode_datetime(black_box(dt)).unwrap())
    });

    group.finish();
}

fn bench_cells(c: &mut Criterion) {
    let mut group = c.benchmark_group("cells");

    let text = "This is a typical database column value with some content";
    let utf16 = tds_protocol::codec::encode_utf16(text);
    let info = TypeInfo::new(TypeId::NVarChar).with_max_length(8000);
    group.throughput(Throughput::Bytes(utf16.len() as u64));
    group.bench_function("utf16_decode", |b| {
        b.iter(|| decode_utf16_string(black_box(&utf16)).unwrap())
    });
    group.bench_function("decode_nvarchar", |b| {
        b.iter(|| decode_value(&info, Some(black_box(&utf16))).unwrap())
    });

    let ctx = ParamContext::default();
    let value = SqlValue::String(text.to_owned());
    group.bench_function("encode_param_string", |b| {
        b.iter(|| encode_param(black_box(&value), &ctx).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_vector,
    bench_half_precision,
    bench_fixed_codecs,
    bench_cells,
);

criterion_main!(benches);
