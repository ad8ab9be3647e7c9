//! Benchmarks for frame encoding and reassembly
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use peerlink::network::wire::{encode_frame, FrameReader};
use rand::{Rng, SeedableRng};

fn stream_of(frames: usize, body_len: usize) -> Vec<u8> {
    let body = vec![0xA5u8; body_len];
    let mut stream = Vec::new();
    for _ in 0..frames {
        stream.extend_from_slice(&encode_frame(&body).unwrap());
    }
    stream
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    for size in [16usize, 1024, 64 * 1024] {
        let body = vec![7u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| encode_frame(black_box(body)).unwrap())
        });
    }
    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble");
    for (frames, body_len) in [(1000usize, 64usize), (100, 16 * 1024)] {
        let stream = stream_of(frames, body_len);

        // Chunk boundaries that never line up with frames
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < stream.len() {
            let len = rng.gen_range(1..=1500).min(stream.len() - offset);
            chunks.push(&stream[offset..offset + len]);
            offset += len;
        }

        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_function(BenchmarkId::new("frames", format!("{}x{}", frames, body_len)), |b| {
            b.iter(|| {
                let mut reader = FrameReader::new();
                let mut buffer = BytesMut::new();
                let mut seen = 0;
                for chunk in &chunks {
                    buffer.extend_from_slice(chunk);
                    while let Some(frame) = reader.push(&mut buffer).unwrap() {
                        seen += frame.len();
                    }
                }
                black_box(seen)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_reassembly);
criterion_main!(benches);
