//! Codec benchmarks: request chunking, chunk decoding, control decoding.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use wsmux_protocol::{
    ChunkFrame, CorrelationId, Decoder, Encoder, MessageKind, RequestFrame, ResponseFrame,
    WireMessage,
};

const MAX_PACKET_SIZE: usize = 16 * 1024;

fn create_test_request() -> RequestFrame {
    let mut headers = wsmux_protocol::HeaderMap::new();
    headers.insert("content-type".into(), "application/octet-stream".into());
    headers.insert("accept".into(), "*/*".into());
    RequestFrame::new(CorrelationId::new(), "POST", "https://example.com/upload")
        .with_headers(headers)
}

fn bench_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");

    for size in [1_000, 100_000, 1_000_000] {
        let body = Bytes::from(vec![0x5a; size]);
        let request = create_test_request();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| {
                black_box(
                    Encoder::encode_request(request.clone(), body.clone(), MAX_PACKET_SIZE)
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_encode_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_message");
    let id = CorrelationId::new();

    for size in [64, 4_096, 65_536] {
        let payload = Bytes::from("x".repeat(size));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                black_box(
                    Encoder::encode_message(id, MessageKind::Text, payload.clone(), MAX_PACKET_SIZE)
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_decode_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_chunk");
    let id = CorrelationId::new();

    for size in [100, 4_096, MAX_PACKET_SIZE - 18] {
        let encoded = ChunkFrame::new(id, 7, Bytes::from(vec![1u8; size])).encode();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(Decoder::decode(WireMessage::Binary(encoded.clone())).unwrap()));
        });
    }

    group.finish();
}

fn bench_decode_control(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_control");

    for header_count in [0, 10, 50] {
        let mut response = ResponseFrame::new(CorrelationId::new(), "https://example.com/", 200)
            .with_status_text("OK");
        for i in 0..header_count {
            response = response.with_header(format!("x-header-{}", i), "v".repeat(32));
        }
        let text = Encoder::encode_response(response, Bytes::new(), MAX_PACKET_SIZE)
            .unwrap()
            .control;

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(header_count),
            &text,
            |b, text| {
                b.iter(|| black_box(Decoder::decode_control(text).unwrap()));
            },
        );
    }

    group.finish();
}

fn bench_correlation_id(c: &mut Criterion) {
    let id = CorrelationId::new();
    let json = serde_json::to_string(&id).unwrap();

    c.bench_function("correlation_id_new", |b| b.iter(|| black_box(CorrelationId::new())));
    c.bench_function("correlation_id_from_json", |b| {
        b.iter(|| black_box(serde_json::from_str::<CorrelationId>(&json).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_encode_request,
    bench_encode_message,
    bench_decode_chunk,
    bench_decode_control,
    bench_correlation_id
);
criterion_main!(benches);
