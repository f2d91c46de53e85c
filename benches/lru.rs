use blockcache::builder::LruCacheBuilder;
use blockcache::{Priority, ShardedLruCache};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn noop_deleter() -> blockcache::Deleter<u64> {
    Box::new(|_, _| {})
}

fn filled_cache(capacity: usize, bits: i32, entries: u32) -> ShardedLruCache<u64> {
    let cache = LruCacheBuilder::new(capacity)
        .num_shard_bits(bits)
        .try_build()
        .unwrap();
    for i in 0..entries {
        let key = i.to_be_bytes();
        cache.insert(&key, i.wrapping_mul(0x9e3779b9), i as u64, 32, noop_deleter(), Priority::Low);
    }
    cache
}

fn bench_insert_churn(c: &mut Criterion) {
    c.bench_function("lru_insert_churn", |b| {
        b.iter_batched(
            || filled_cache(1024 * 32, 0, 1024),
            |cache| {
                for i in 0..4096u32 {
                    let key = (10_000 + i).to_be_bytes();
                    cache.insert(
                        std::hint::black_box(&key),
                        (10_000 + i).wrapping_mul(0x9e3779b9),
                        i as u64,
                        32,
                        noop_deleter(),
                        Priority::Low,
                    );
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_lookup_hit(c: &mut Criterion) {
    c.bench_function("lru_lookup_hit", |b| {
        b.iter_batched(
            || filled_cache(1024 * 64, 0, 1024),
            |cache| {
                for i in 0..1024u32 {
                    let key = i.to_be_bytes();
                    if let Some(handle) =
                        cache.lookup(std::hint::black_box(&key), i.wrapping_mul(0x9e3779b9))
                    {
                        let _ = std::hint::black_box(cache.value_with(&handle, |v| *v));
                        cache.release(handle, false);
                    }
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_mixed_workload_sharded(c: &mut Criterion) {
    c.bench_function("lru_mixed_workload_16_shards", |b| {
        b.iter_batched(
            || (filled_cache(1024 * 64, 4, 2048), StdRng::seed_from_u64(42)),
            |(cache, mut rng)| {
                for _ in 0..4096 {
                    let i: u32 = rng.gen_range(0..4096);
                    let key = i.to_be_bytes();
                    let hash = i.wrapping_mul(0x9e3779b9);
                    if rng.gen_bool(0.75) {
                        if let Some(handle) = cache.lookup(std::hint::black_box(&key), hash) {
                            cache.release(handle, false);
                        }
                    } else {
                        cache.insert(&key, hash, i as u64, 32, noop_deleter(), Priority::Low);
                    }
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_insert_churn,
    bench_lookup_hit,
    bench_mixed_workload_sharded
);
criterion_main!(benches);
