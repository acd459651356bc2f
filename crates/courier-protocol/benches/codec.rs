//! Codec benchmarks for courier-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use courier_protocol::{codec, Message};

fn bench_encode_small(c: &mut Criterion) {
    let msg = Message::new(1, 1, "/test", "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode(black_box(&msg))));
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let msg = Message::new(1, 1, "/test", "x".repeat(64));
    let encoded = codec::encode(&msg);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_escaped_roundtrip(c: &mut Criterion) {
    let msg = Message::new(1, 1, "/site|forum|topic", "x".repeat(256)).with_user_ids([1, 2, 3]);

    c.bench_function("roundtrip_escaped_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&msg));
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_escaped_roundtrip
);
criterion_main!(benches);
