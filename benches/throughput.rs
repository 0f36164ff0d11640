//! Throughput benchmarks

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use netspeed::protocol::{
    DEFAULT_CHUNK_SIZE, OfferMessage, PAYLOAD_HEADER_LEN, PayloadHeader, RequestMessage,
};
use netspeed::udp::SegmentTracker;

fn bench_payload_header_encode(c: &mut Criterion) {
    let mut buffer = vec![0u8; PAYLOAD_HEADER_LEN + DEFAULT_CHUNK_SIZE];

    c.bench_function("payload_header_encode", |b| {
        b.iter(|| {
            PayloadHeader::encode_into(black_box(1024), black_box(512), &mut buffer);
        })
    });
}

fn bench_payload_header_decode(c: &mut Criterion) {
    let mut buffer = vec![0u8; PAYLOAD_HEADER_LEN + DEFAULT_CHUNK_SIZE];
    PayloadHeader::encode_into(1024, 512, &mut buffer);

    c.bench_function("payload_header_decode", |b| {
        b.iter(|| PayloadHeader::decode(black_box(&buffer)))
    });
}

fn bench_control_decode(c: &mut Criterion) {
    let offer = OfferMessage {
        udp_port: 30002,
        tcp_port: 30003,
    }
    .encode();
    let request = RequestMessage { file_size: 1 << 30 }.encode();

    c.bench_function("offer_decode", |b| {
        b.iter(|| OfferMessage::decode(black_box(&offer)))
    });
    c.bench_function("request_decode", |b| {
        b.iter(|| RequestMessage::decode(black_box(&request)))
    });
}

fn bench_segment_tracker(c: &mut Criterion) {
    c.bench_function("segment_tracker_10k", |b| {
        b.iter(|| {
            let mut tracker = SegmentTracker::new(10_000);
            for index in 0..10_000u64 {
                tracker.record(10_000, black_box(index));
            }
            tracker.received()
        })
    });
}

criterion_group!(
    benches,
    bench_payload_header_encode,
    bench_payload_header_decode,
    bench_control_decode,
    bench_segment_tracker
);
criterion_main!(benches);
