//! Benchmarks for packet framing and compression.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio_util::codec::Decoder;
use weft_proto::compressor::{self, CompressorName};
use weft_proto::packet::object::{encode_data_frame, ObjectAddress, ObjectDataHeader, ObjectDataPacket};
use weft_proto::packet::ObjectCommand;
use weft_proto::{FrameCodec, InstanceId, ObjectId, Version};

fn sample_header() -> ObjectDataHeader {
    ObjectDataHeader {
        address: ObjectAddress::new(ObjectId(42), InstanceId(1)),
        version: Version::FIRST,
        last: true,
        ..Default::default()
    }
}

fn benchmark_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Object Data Framing");

    for size in [64usize, 4096, 60_000] {
        let payload = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            b.iter(|| {
                let frame = encode_data_frame(
                    ObjectCommand::Instance,
                    black_box(&sample_header()),
                    &[payload.as_slice()],
                );
                black_box(frame)
            })
        });

        let frame = encode_data_frame(ObjectCommand::Instance, &sample_header(), &[payload.as_slice()]);
        group.bench_with_input(BenchmarkId::new("codec_parse", size), &frame, |b, frame| {
            b.iter(|| {
                let mut codec = FrameCodec::new();
                let mut buf = BytesMut::from(&frame[..]);
                let out = codec.decode(&mut buf).unwrap().unwrap();
                let packet = ObjectDataPacket::parse(&out).unwrap();
                black_box(packet.wire_size())
            })
        });
    }

    group.finish();
}

fn benchmark_rle(c: &mut Criterion) {
    let mut group = c.benchmark_group("RLE");
    let rle = compressor::lookup(CompressorName::Rle).unwrap().unwrap();

    let sparse: Vec<u8> = (0..60_000u32).map(|i| if i % 97 == 0 { i as u8 } else { 0 }).collect();
    let noisy: Vec<u8> = (0..60_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect();

    for (name, input) in [("sparse", &sparse), ("noisy", &noisy)] {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_function(BenchmarkId::new("compress", name), |b| {
            b.iter(|| black_box(rle.compress(black_box(input)).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_framing, benchmark_rle);
criterion_main!(benches);
