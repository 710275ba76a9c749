use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use libreadahead::{CacheStrategy, CircularCache, DoubleCache, SimpleFileCache};

const CHUNK: usize = 64 * 1024;

fn bench_circular_operations(c: &mut Criterion) {
    let cache = CircularCache::new(4 * 1024 * 1024, 1024 * 1024);
    cache.open().unwrap();
    let data = vec![0xA5u8; CHUNK];
    let mut out = vec![0u8; CHUNK];

    c.bench_function("circular_write_read_64k", |b| {
        b.iter(|| {
            let mut written = 0;
            while written < CHUNK {
                written += cache.write(black_box(&data[written..])).unwrap();
            }
            let mut read = 0;
            while read < CHUNK {
                read += cache.read(black_box(&mut out[read..])).unwrap();
            }
        })
    });

    c.bench_function("circular_seek_in_history", |b| {
        b.iter(|| {
            let end = cache.cached_data_end_pos();
            let _ = cache.seek(black_box(end - 1024));
            let _ = cache.seek(black_box(end));
        })
    });
}

fn bench_file_cache_operations(c: &mut Criterion) {
    let cache = SimpleFileCache::new().with_max_write_size(CHUNK);
    cache.open().unwrap();
    let data = vec![0x5Au8; CHUNK];
    let mut out = vec![0u8; CHUNK];

    c.bench_function("file_cache_write_read_64k", |b| {
        b.iter(|| {
            cache.write(black_box(&data)).unwrap();
            let mut read = 0;
            while read < CHUNK {
                read += cache.read(black_box(&mut out[read..])).unwrap();
            }
        })
    });
    cache.close();
}

fn bench_double_cache_swap(c: &mut Criterion) {
    let inner = CircularCache::new(256 * 1024, 64 * 1024).with_seek_wait(0, Duration::ZERO);
    let cache = DoubleCache::new(Box::new(inner));
    cache.open().unwrap();
    let data = vec![1u8; CHUNK];

    cache.write(&data).unwrap();
    cache.reset(10_000_000).unwrap();
    cache.write(&data).unwrap();

    c.bench_function("double_cache_swap", |b| {
        b.iter(|| {
            cache.reset(black_box(100)).unwrap();
            cache.reset(black_box(10_000_100)).unwrap();
        })
    });
}

criterion_group!(benches, bench_circular_operations, bench_file_cache_operations, bench_double_cache_swap);
criterion_main!(benches);
