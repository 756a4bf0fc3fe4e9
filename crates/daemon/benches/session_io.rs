//! Performance benchmarks for the session I/O hot paths.
//!
//! - Key sequence encoding
//! - Output buffer appends under eviction
//! - Output buffer reads
//! - Envelope serialization

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daemon::session::buffer::{OutputBuffer, Utf8Stream};
use daemon::session::encode_keys;
use protocol::messages::SessionOutput;
use protocol::{Envelope, Message};

fn bench_encode_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_keys");

    let inputs = [
        ("literal", "print('hello world') and some more plain text".to_string()),
        ("named", "Up Up Down Down Left Right Left Right Tab Enter".to_string()),
        ("modified", "C-a C-e M-b M-f C-k C-y C-c C-d".to_string()),
        ("long_line", "echo ".repeat(200) + "Enter"),
    ];

    for (name, keys) in &inputs {
        group.throughput(Throughput::Bytes(keys.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), keys, |b, keys| {
            b.iter(|| encode_keys(black_box(keys)));
        });
    }

    group.finish();
}

fn bench_buffer_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_push");

    let chunk: String = (0..64).map(|i| format!("line {i} of output\n")).collect();
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    for max_lines in [100usize, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("evicting", max_lines),
            &max_lines,
            |b, &max_lines| {
                let mut buffer = OutputBuffer::new(max_lines);
                b.iter(|| buffer.push_str(black_box(&chunk)));
            },
        );
    }

    let raw = chunk.as_bytes();
    group.bench_function("utf8_decode_then_push", |b| {
        let mut decoder = Utf8Stream::default();
        let mut buffer = OutputBuffer::new(10_000);
        b.iter(|| {
            let text = decoder.decode(black_box(raw));
            buffer.push_str(&text);
        });
    });

    group.finish();
}

fn bench_buffer_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_read");

    let mut full = OutputBuffer::new(10_000);
    for i in 0..10_000 {
        full.push_str(&format!("{i:>6} some representative terminal output\n"));
    }

    group.bench_function("peek_10k_lines", |b| {
        b.iter(|| black_box(full.read(false)));
    });

    group.bench_function("drain_10k_lines", |b| {
        b.iter_batched(
            || full.clone(),
            |mut buffer| black_box(buffer.read(true)),
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_envelope_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_serialization");

    for lines in [1usize, 100, 1000] {
        let content: String = (0..lines).map(|i| format!("output line {i}\n")).collect();
        let envelope = Envelope::new(
            1,
            Message::SessionOutput(SessionOutput {
                session_id: "1700000000000-deadbeef".to_string(),
                content,
                lines,
                has_more: false,
                dropped: 0,
            }),
        );
        let json = envelope.to_json().unwrap_or_default();
        group.throughput(Throughput::Bytes(json.len() as u64));

        group.bench_with_input(BenchmarkId::new("to_json", lines), &envelope, |b, env| {
            b.iter(|| black_box(env).to_json());
        });
        group.bench_with_input(BenchmarkId::new("from_json", lines), &json, |b, json| {
            b.iter(|| Envelope::from_json(black_box(json)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_keys,
    bench_buffer_push,
    bench_buffer_read,
    bench_envelope_serialization,
);
criterion_main!(benches);
