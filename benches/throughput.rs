use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use weft::command::{CommandCache, Dispatcher, Handler};
use weft::stream::DataOStream;
use weft_proto::compressor::{self, CompressorName};
use weft_proto::packet::Packet;
use weft_proto::packet::node::PingPacket;
use weft_proto::packet::object::ObjectAddress;
use weft_proto::packet::ObjectCommand;
use weft_proto::{InstanceId, ObjectId};

// Allocation and inline dispatch of small node packets, the receiver's hot path.
fn command_cache_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("command");
    group.throughput(Throughput::Elements(1));

    let cache = CommandCache::new();
    let dispatcher = Dispatcher::new("bench");
    let handler: Handler = Arc::new(|_| true);
    dispatcher
        .register_command(PingPacket::COMMAND, handler, None)
        .expect("fresh dispatcher");
    let frame = PingPacket { time: 42 }.to_frame();

    group.bench_function("alloc_dispatch_ping", |b| {
        b.iter(|| {
            let command = cache.alloc_frame(None, &frame);
            dispatcher.dispatch_command(&command)
        })
    });

    group.finish();
}

// Serializing instance data into a stream, with and without compression.
fn stream_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream");
    let payload: Vec<u64> = (0..8192).map(|i| i / 16).collect();
    group.throughput(Throughput::Bytes((payload.len() * 8) as u64));

    for name in [CompressorName::None, CompressorName::Rle] {
        let compressor = compressor::lookup(name).expect("built-in compressor");
        group.bench_function(format!("write_64k_{name}"), |b| {
            b.iter(|| {
                let mut os = DataOStream::for_object(
                    ObjectCommand::Instance,
                    ObjectAddress::new(ObjectId(1), InstanceId::ALL),
                    InstanceId(0),
                    64 * 1024,
                    compressor,
                );
                os.enable_save();
                os.enable(Vec::new());
                os.write(&payload);
                os.disable();
                os.buffer().len()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, command_cache_benchmark, stream_benchmark);
criterion_main!(benches);
