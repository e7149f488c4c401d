use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tpc_core::frame::{Frame, FrameCodec};

fn bench_encode(c: &mut Criterion) {
    let codec = FrameCodec::new(16 << 20);
    let mut group = c.benchmark_group("encode");
    for size in [0usize, 64, 4096, 256 * 1024] {
        let frame = Frame::request(1, 500, 3, Bytes::from(vec![0x5A; size]));
        group.throughput(Throughput::Bytes(frame.encoded_len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            let mut buf = BytesMut::with_capacity(frame.encoded_len() * 2);
            b.iter(|| {
                buf.clear();
                codec.encode_message(black_box(frame), 64 * 1024, &mut buf);
            });
        });
    }
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    let codec = FrameCodec::new(16 << 20);
    let mut stream = BytesMut::new();
    for i in 0..1024u64 {
        codec.encode(&Frame::request(2, i, (i % 271) as i32, Bytes::from(vec![1u8; 128])), &mut stream);
    }
    let stream = stream.freeze();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("1024x128B", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            let mut n = 0;
            while let Ok(Some(frame)) = codec.decode(&mut buf) {
                n += frame.payload.len();
            }
            black_box(n)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_stream);
criterion_main!(benches);
