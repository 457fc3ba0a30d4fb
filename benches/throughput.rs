//! Protocol throughput benchmarks.
//!
//! Measures the two hot paths in isolation: decoding pipelined command
//! buffers and encoding reply batches. No sockets involved; the parser
//! reads from an in-memory slice.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use respd::{CommandReader, ReplyWriter};

fn pipeline_wire(commands: usize) -> Vec<u8> {
    let mut wire = Vec::new();
    for i in 0..commands {
        let key = format!("key:{i}");
        let value = format!("value:{i}");
        wire.extend_from_slice(
            format!(
                "*3\r\n$3\r\nSET\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
                key.len(),
                key,
                value.len(),
                value
            )
            .as_bytes(),
        );
    }
    wire
}

fn bench_parse(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("parse");

    let ping = b"*1\r\n$4\r\nPING\r\n".to_vec();
    group.throughput(Throughput::Elements(1));
    group.bench_function("resp_ping", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut reader = CommandReader::new();
                let mut input: &[u8] = &ping;
                let batch = reader.read_commands(&mut input).await.unwrap();
                black_box(batch.len());
            })
        });
    });

    let pipeline = pipeline_wire(100);
    group.throughput(Throughput::Elements(100));
    group.bench_function("resp_pipeline_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut reader = CommandReader::new();
                let mut input: &[u8] = &pipeline;
                let batch = reader.read_commands(&mut input).await.unwrap();
                black_box(batch.len());
            })
        });
    });

    let inline = b"set \"some key\" \"some\\tvalue\"\r\n".to_vec();
    group.throughput(Throughput::Elements(1));
    group.bench_function("inline_quoted", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut reader = CommandReader::new();
                let mut input: &[u8] = &inline;
                let batch = reader.read_commands(&mut input).await.unwrap();
                black_box(batch.len());
            })
        });
    });

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(100));

    group.bench_function("bulk_replies_100", |b| {
        let value = "x".repeat(64);
        b.iter(|| {
            let mut writer = ReplyWriter::new();
            for _ in 0..100 {
                writer.write_bulk(&value);
            }
            black_box(&writer);
        });
    });

    group.bench_function("mixed_replies_100", |b| {
        b.iter(|| {
            let mut writer = ReplyWriter::new();
            for i in 0..25 {
                writer.write_string("OK");
                writer.write_int(i);
                writer.write_array(1);
                writer.write_null();
            }
            black_box(&writer);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_encode);
criterion_main!(benches);
