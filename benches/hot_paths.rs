//! Hot path benchmarks.
//!
//! Run with: `cargo bench --bench hot_paths`
//!
//! Covers what every message or log entry goes through: envelope
//! encoding in both wire formats, domain key parsing for key events,
//! key glob matching and RESP frame decoding.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fogsync::envelope::{Envelope, WireFormat};
use fogsync::transport::backend::glob_match;
use fogsync::transport::{RespCodec, RespValue};
use fogsync::{DomainKey, Level, LogValue, LogicalClock};
use serde_json::json;
use tokio_util::codec::{Decoder, Encoder};

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    group.throughput(Throughput::Elements(1));

    let envelope = Envelope::new(
        LogicalClock::new(12, 3),
        "gateway-7",
        Level::Fog,
        json!({"alarm": "overheat", "zone": 4, "threshold": 81.5}),
    );

    for (name, format) in [("json", WireFormat::Json), ("cbor", WireFormat::Cbor)] {
        let encoded = envelope.encode(format).unwrap();
        group.bench_function(format!("encode_{}", name), |b| {
            b.iter(|| black_box(&envelope).encode(format).unwrap())
        });
        group.bench_function(format!("decode_{}", name), |b| {
            b.iter(|| Envelope::decode(black_box(&encoded)).unwrap())
        });
    }

    group.finish();
}

fn bench_log_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_value");
    let number = LogValue::from(21.5);
    let text = LogValue::from("door-open");
    group.bench_function("encode_number", |b| b.iter(|| black_box(&number).encode().unwrap()));
    group.bench_function("encode_text", |b| b.iter(|| black_box(&text).encode().unwrap()));
    group.finish();
}

fn bench_domain_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("domain_key");
    let key = "aps[plant].ns[sensors].ds[temperature].dts[gateway-7_fog]";
    group.bench_function("parse_stream_key", |b| {
        b.iter(|| DomainKey::parse(black_box(key)).unwrap())
    });

    let pattern = DomainKey::data_source("plant", "sensors", "temperature").stream_pattern();
    group.bench_function("glob_match", |b| {
        b.iter(|| glob_match(black_box(&pattern), black_box(key)))
    });
    group.finish();
}

fn bench_resp_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("resp_decode");

    let mut frame = BytesMut::new();
    let push = RespValue::command([
        "pmessage",
        "__keyevent*",
        "__keyevent@0__:xadd",
        "aps[plant].ns[global].ds[temp].dts[d1_device]",
    ]);
    RespCodec.encode(push, &mut frame).unwrap();
    let frame = frame.freeze();

    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("keyevent_push", |b| {
        b.iter(|| {
            let mut codec = RespCodec;
            let mut buf = BytesMut::from(&frame[..]);
            codec.decode(black_box(&mut buf)).unwrap()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope,
    bench_log_value,
    bench_domain_key,
    bench_resp_decode
);
criterion_main!(benches);
