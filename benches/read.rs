//! Micro-benchmarks for the table read path.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench read              # run all read benchmarks
//! cargo bench --bench read -- seek      # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use petra::base::{InternalKey, KeyKind};
use petra::block::cache::BlockCache;
use petra::iterator::IterTransforms;
use petra::readable::{FileReadable, ReadContext};
use petra::reader::iter::SstIterator;
use petra::reader::{Reader, ReaderOptions};
use petra::writer::{SstWriter, WriterOptions};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

const NUM_ENTRIES: u64 = 10_000;

/// Format a zero-padded key.
fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// Build a table of `NUM_ENTRIES` 128-byte values in the given format.
fn build_table(dir: &std::path::Path, columnar: bool) -> std::path::PathBuf {
    let path = dir.join(if columnar { "bench_v2.sst" } else { "bench_v1.sst" });
    let opts = if columnar {
        WriterOptions::default()
    } else {
        WriterOptions::v1()
    };
    let mut w = SstWriter::new(&path, opts).expect("create writer");
    let value = [0xAB_u8; 128];
    for i in 0..NUM_ENTRIES {
        w.add(&InternalKey::new(make_key(i), i + 1, KeyKind::Set), &value)
            .expect("add");
    }
    w.finish().expect("finish");
    path
}

fn open_cached(path: &std::path::Path) -> Arc<Reader> {
    let mut options = ReaderOptions::default();
    options.cache = Some(Arc::new(BlockCache::new(4096)));
    let readable = Box::new(FileReadable::open(path).expect("open file"));
    Reader::new(&ReadContext::new(), readable, options).expect("open reader")
}

// ------------------------------------------------------------------------------------------------
// Benchmarks
// ------------------------------------------------------------------------------------------------

fn bench_open(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let mut group = c.benchmark_group("open");
    for columnar in [false, true] {
        let path = build_table(tmp.path(), columnar);
        group.bench_with_input(
            BenchmarkId::from_parameter(if columnar { "v2" } else { "v1" }),
            &path,
            |b, path| {
                b.iter(|| {
                    let readable = Box::new(FileReadable::open(path).unwrap());
                    let reader =
                        Reader::new(&ReadContext::new(), readable, ReaderOptions::default())
                            .unwrap();
                    black_box(reader.common_properties().num_entries)
                });
            },
        );
    }
    group.finish();
}

fn bench_full_scan(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let mut group = c.benchmark_group("full_scan");
    group.throughput(Throughput::Elements(NUM_ENTRIES));
    for columnar in [false, true] {
        let path = build_table(tmp.path(), columnar);
        let reader = open_cached(&path);
        group.bench_with_input(
            BenchmarkId::from_parameter(if columnar { "v2" } else { "v1" }),
            &reader,
            |b, reader| {
                b.iter(|| {
                    let mut it = reader
                        .new_iter(IterTransforms::none(), None, None)
                        .unwrap();
                    let mut count = 0u64;
                    let mut entry = it.first().unwrap();
                    while let Some((key, _)) = entry {
                        count += key.user_key.len() as u64;
                        entry = it.next().unwrap();
                    }
                    black_box(count)
                });
            },
        );
    }
    group.finish();
}

fn bench_seek(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let mut group = c.benchmark_group("seek_ge");
    for columnar in [false, true] {
        let path = build_table(tmp.path(), columnar);
        let reader = open_cached(&path);
        group.bench_with_input(
            BenchmarkId::from_parameter(if columnar { "v2" } else { "v1" }),
            &reader,
            |b, reader| {
                let mut it = reader
                    .new_iter(IterTransforms::none(), None, None)
                    .unwrap();
                let mut i = 0u64;
                b.iter(|| {
                    i = (i * 7 + 13) % NUM_ENTRIES;
                    let hit = it.seek_ge(&make_key(i)).unwrap();
                    black_box(hit.is_some())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_open, bench_full_scan, bench_seek);
criterion_main!(benches);
