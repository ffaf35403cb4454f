use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use dossier::{
    Clock, EntityId, EvictionConfig, EvictionPolicy, ManualClock, RecordStore, Snapshot, StoreConfig,
};

/// 200 entities with 5 images of 4 KiB each; a quarter of them stale.
fn seeded_snapshot(clock: &Arc<ManualClock>) -> Snapshot {
    let mut store = RecordStore::new(StoreConfig::default(), clock.clone());
    for n in 0..200u32 {
        if n == 50 {
            clock.advance(Duration::days(10));
        }
        let id = EntityId::new(format!("entity-{n:04}")).unwrap();
        store.upsert(&id, |r| {
            r.set_field("index", i64::from(n));
            r.set_field("label", format!("Entity {n}"));
        });
        for img in 0..5u8 {
            store
                .append_image(&id, vec![img; 4096], format!("{n}-{img}.png"))
                .unwrap();
        }
    }
    store.snapshot()
}

fn bench_encode(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
    let snapshot = seeded_snapshot(&clock);
    let size = snapshot.encoded_len().unwrap();

    let mut group = c.benchmark_group("snapshot");
    group.throughput(Throughput::Bytes(size));
    group.bench_function("to_bytes", |b| b.iter(|| snapshot.to_bytes().unwrap()));

    let bytes = snapshot.to_bytes().unwrap();
    group.bench_function("from_bytes", |b| b.iter(|| Snapshot::from_bytes(&bytes).unwrap()));
    group.finish();
}

fn bench_evict(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
    let snapshot = seeded_snapshot(&clock);
    let now = clock.now();
    let size = snapshot.encoded_len().unwrap();

    let mut group = c.benchmark_group("eviction");
    group.throughput(Throughput::Elements(snapshot.record_count() as u64));

    let stale_only = EvictionPolicy::new(EvictionConfig::default());
    group.bench_function("stale_pass", |b| {
        b.iter_batched(
            || snapshot.clone(),
            |s| stale_only.evict(&s, size * 4 / 5, now).unwrap(),
            BatchSize::LargeInput,
        );
    });

    let aggressive = EvictionPolicy::new(EvictionConfig {
        retained_images_per_entity: 2,
        ..EvictionConfig::default()
    });
    group.bench_function("full_pass", |b| {
        b.iter_batched(
            || snapshot.clone(),
            |s| aggressive.evict(&s, size / 4, now).unwrap(),
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_evict);
criterion_main!(benches);
