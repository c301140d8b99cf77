//! Benchmarks for wire value decoding and parameter encoding.

#![allow(clippy::unwrap_used, missing_docs)]

use bytes::BytesMut;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rust_decimal::Decimal;
use std::hint::black_box;
use tds_types::{
    CodecOptions, ColumnType, ParamDescriptor, SqlValue, TypeId, decode_value, encode_value,
    resolve_param_type,
};

fn nvarchar_wire(s: &str) -> Vec<u8> {
    let utf16: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let mut wire = (utf16.len() as u16).to_le_bytes().to_vec();
    wire.extend_from_slice(&utf16);
    wire
}

fn bench_decode(c: &mut Criterion) {
    let opts = CodecOptions::default();
    let mut group = c.benchmark_group("decode_value");

    let int_col = ColumnType::new(TypeId::IntN);
    let int_wire = [4u8, 0x2A, 0, 0, 0];
    group.bench_function("intn", |b| {
        b.iter(|| {
            let mut src = &int_wire[..];
            black_box(decode_value(&mut src, &int_col, &opts).unwrap())
        })
    });

    let text = "This is a typical database column value with some content";
    let str_col = ColumnType::new(TypeId::NVarChar);
    let str_wire = nvarchar_wire(text);
    group.throughput(Throughput::Bytes(str_wire.len() as u64));
    group.bench_function("nvarchar", |b| {
        b.iter(|| {
            let mut src = &str_wire[..];
            black_box(decode_value(&mut src, &str_col, &opts).unwrap())
        })
    });

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let opts = CodecOptions::default();
    let mut group = c.benchmark_group("encode_param");

    for (name, value) in [
        ("int", SqlValue::Int(42)),
        ("decimal", SqlValue::Decimal(Decimal::new(1_234_567, 2))),
        ("string", SqlValue::from("Hello, world")),
    ] {
        let param = ParamDescriptor::input("@p", value);
        let col = resolve_param_type(&param, &opts).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(64);
                encode_value(black_box(&param.value), &col, &opts, &mut buf).unwrap();
                black_box(buf)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
