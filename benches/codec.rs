use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use nackft::segment::{self, DecodedSegment};
use nackft::DEFAULT_SEGMENT_SIZE;

fn codec_benchmark(c: &mut Criterion) {
    let payload = vec![0xABu8; DEFAULT_SEGMENT_SIZE];
    let frame: Bytes = segment::encode(42, &payload);

    let mut group = c.benchmark_group("segment");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("checksum", |b| b.iter(|| segment::checksum(black_box(&payload))));
    group.bench_function("encode", |b| b.iter(|| segment::encode(black_box(42), black_box(&payload))));
    group.bench_function("decode_verify", |b| {
        b.iter(|| {
            DecodedSegment::decode(black_box(frame.clone()))
                .and_then(DecodedSegment::into_verified)
        })
    });
    group.finish();
}

criterion_group!(benches, codec_benchmark);
criterion_main!(benches);
