//! Benchmarks for zar codec, micro-index and overlap merge
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::tempdir;
use zar::archive::{merge_chunks, Chunk, LogId};
use zar::microindex::{Finder, Writer as IndexWriter};
use zar::record::{Column, Reader, Record, Type, TypeContext, Value, Writer, WriterOptions};
use zar::span::{Direction, Span};

fn create_test_records(zctx: &TypeContext, count: usize) -> Vec<Record> {
    let ty = zctx
        .lookup_record(vec![
            Column::new("ts", Type::Time),
            Column::new("key", Type::Int64),
            Column::new("msg", Type::String),
        ])
        .unwrap();
    (0..count)
        .map(|i| {
            Record::new(
                ty.clone(),
                vec![
                    Value::Time(1_587_427_200_000_000_000 + i as i64 * 1000),
                    Value::Int(i as i64),
                    Value::String(format!("event {}", i % 97)),
                ],
            )
            .unwrap()
        })
        .collect()
}

fn encode(records: &[Record], opts: WriterOptions) -> Vec<u8> {
    let mut w = Writer::with_options(Vec::new(), opts);
    for rec in records {
        w.write(rec).unwrap();
    }
    w.into_inner().unwrap()
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let zctx = Arc::new(TypeContext::new());

    for size in [1000, 10000] {
        let records = create_test_records(&zctx, size);
        group.throughput(Throughput::Elements(size as u64));

        for (label, lz4) in [("plain", 0usize), ("lz4", 32 * 1024)] {
            let opts = WriterOptions {
                lz4_block_size: lz4,
                ..Default::default()
            };
            group.bench_function(format!("encode_{}_{}", label, size), |b| {
                b.iter(|| encode(black_box(&records), opts))
            });

            let encoded = encode(&records, opts);
            group.bench_function(format!("decode_{}_{}", label, size), |b| {
                b.iter(|| {
                    let mut r = Reader::new(Cursor::new(black_box(&encoded)), zctx.clone());
                    let mut n = 0;
                    while r.read().unwrap().is_some() {
                        n += 1;
                    }
                    n
                })
            });
        }
    }

    group.finish();
}

fn bench_microindex(c: &mut Criterion) {
    let mut group = c.benchmark_group("microindex");
    let zctx = Arc::new(TypeContext::new());
    let records = create_test_records(&zctx, 50_000);
    let dir = tempdir().unwrap();

    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("build_50000", |b| {
        let path = dir.path().join("build.idx");
        b.iter(|| {
            let mut w = IndexWriter::new(zctx.clone(), &path, vec!["key".into()]).frame_thresh(4096);
            for rec in &records {
                w.write(rec).unwrap();
            }
            w.close().unwrap();
        })
    });

    let path = dir.path().join("lookup.idx");
    let mut w = IndexWriter::new(zctx.clone(), &path, vec!["key".into()]).frame_thresh(4096);
    for rec in &records {
        w.write(rec).unwrap();
    }
    w.close().unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("lookup", |b| {
        let mut finder = Finder::open(zctx.clone(), &path).unwrap();
        let mut key = 0i64;
        b.iter(|| {
            key = (key + 7919) % 50_000;
            finder.lookup(black_box(&[Value::Int(key)])).unwrap()
        })
    });

    group.finish();
}

fn bench_overlap(c: &mut Criterion) {
    let mut group = c.benchmark_group("overlap");
    let base = 1_587_427_200_000_000_000i64;

    for count in [100, 1000] {
        // staggered chunks, each overlapping its two neighbours
        let chunks: Vec<Chunk> = (0..count)
            .map(|i| {
                let first = base + i as i64 * 1000;
                Chunk::new(LogId::for_chunk(first), first + 2500, first, 10)
            })
            .collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("merge_{}", count), |b| {
            b.iter(|| merge_chunks(black_box(&chunks), Span::all(), Direction::Reverse))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec, bench_microindex, bench_overlap);
criterion_main!(benches);
