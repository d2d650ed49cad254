//! Codec benchmarks for fleethub-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fleethub_protocol::{codec, InboundEvent, OutboundEvent};
use serde_json::json;

fn location_update() -> InboundEvent {
    InboundEvent::location_update(json!({
        "lat": 52.520008,
        "lng": 13.404954,
        "heading": 270,
        "speed": 12.5
    }))
}

fn bench_json(c: &mut Criterion) {
    let event = location_update();
    let text = codec::encode_json(&event).unwrap();

    let mut group = c.benchmark_group("json");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("encode_location", |b| {
        b.iter(|| codec::encode_json(black_box(&event)))
    });
    group.bench_function("decode_location", |b| {
        b.iter(|| codec::decode_json::<InboundEvent>(black_box(&text)))
    });
    group.finish();
}

fn bench_msgpack(c: &mut Criterion) {
    let event = location_update();
    let encoded = codec::encode(&event).unwrap();

    let mut group = c.benchmark_group("msgpack");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_location", |b| {
        b.iter(|| codec::encode(black_box(&event)))
    });
    group.bench_function("decode_location", |b| {
        b.iter(|| codec::decode::<InboundEvent>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_error_event(c: &mut Criterion) {
    let event = OutboundEvent::error("Driver not authenticated");

    c.bench_function("encode_error_json", |b| {
        b.iter(|| codec::encode_json(black_box(&event)))
    });
}

criterion_group!(benches, bench_json, bench_msgpack, bench_error_event);
criterion_main!(benches);
