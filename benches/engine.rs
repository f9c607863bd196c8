use bitfork::Config;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Bencher, Criterion, Throughput};
use rand::prelude::*;

const ITER: usize = 10_000;
const KEY_SIZE: usize = 32;
const VAL_SIZE: usize = 256;

fn prebuilt_kv_pairs(n: usize, key_size: usize, val_size: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| {
            let key: Vec<u8> = (0..key_size).map(|_| rng.gen()).collect();
            let val: Vec<u8> = (0..val_size).map(|_| rng.gen()).collect();
            (key, val)
        })
        .collect()
}

/// Appends `ITER` fresh keys sequentially into a freshly opened engine.
pub fn bench_put(c: &mut Criterion) {
    let kv_pairs = prebuilt_kv_pairs(ITER, KEY_SIZE, VAL_SIZE);
    let nbytes: usize = kv_pairs.iter().map(|(k, v)| k.len() + v.len()).sum();

    let mut g = c.benchmark_group("engine_put");
    g.throughput(Throughput::Bytes(nbytes as u64));
    g.bench_function("sequential", |b: &mut Bencher| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let engine = Config::default().open(dir.path()).unwrap();
                (engine, dir, kv_pairs.clone())
            },
            |(engine, _dir, kv_pairs)| {
                for (k, v) in kv_pairs {
                    engine.put(black_box(k), black_box(v)).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
    g.finish();
}

/// Reads `ITER` keys, in shuffled order, out of a pre-populated engine.
pub fn bench_get(c: &mut Criterion) {
    let kv_pairs = prebuilt_kv_pairs(ITER, KEY_SIZE, VAL_SIZE);
    let nbytes: usize = kv_pairs.iter().map(|(k, v)| k.len() + v.len()).sum();

    let dir = tempfile::tempdir().unwrap();
    let engine = Config::default().open(dir.path()).unwrap();
    for (k, v) in &kv_pairs {
        engine.put(k.clone(), v.clone()).unwrap();
    }

    let mut g = c.benchmark_group("engine_get");
    g.throughput(Throughput::Bytes(nbytes as u64));
    g.bench_function("sequential", |b: &mut Bencher| {
        b.iter_batched(
            || {
                let mut keys: Vec<_> = kv_pairs.iter().map(|(k, _)| k.clone()).collect();
                keys.shuffle(&mut rand::thread_rng());
                keys
            },
            |keys| {
                for key in keys {
                    engine.get(black_box(&key)).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
    g.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
