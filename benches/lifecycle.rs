//! Performance benchmarks for host saves and reopen.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tether::{ChildSpec, HostSave, HostTarget, LifecycleManager, Store, StoreConfig};

const FIELD: &str = "field_items";

fn create_manager(dir: &TempDir) -> LifecycleManager {
    let store = Store::create(StoreConfig {
        sync_every_commit: false,
        ..StoreConfig::new(dir.path().join("store"))
    })
    .unwrap();
    LifecycleManager::new(Arc::new(store))
}

/// Benchmark saving a new host revision with varying field sizes
fn bench_host_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_save");

    for children in [1, 10, 50] {
        group.bench_with_input(
            BenchmarkId::new("children", children),
            &children,
            |b, &children| {
                let dir = TempDir::new().unwrap();
                let manager = create_manager(&dir);

                let saved = manager
                    .on_host_save(
                        HostSave::new(HostTarget::new_host("node"), FIELD)
                            .children((0..children).map(|n| ChildSpec::new(json!(n)))),
                    )
                    .unwrap();
                let items: Vec<_> = saved.references.iter().map(|r| r.item_id).collect();

                let mut n = 0u64;
                b.iter(|| {
                    n += 1;
                    // Half the children change, so half get new revisions.
                    let specs = items.iter().enumerate().map(|(i, &item_id)| {
                        if i % 2 == 0 {
                            ChildSpec::updated(item_id, json!(n))
                        } else {
                            ChildSpec::existing(item_id)
                        }
                    });
                    black_box(
                        manager
                            .on_host_save(
                                HostSave::new(saved.host.clone(), FIELD)
                                    .new_revision(true)
                                    .children(specs),
                            )
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

/// Benchmark new hosts going through the two-phase save
fn bench_new_host(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let manager = create_manager(&dir);

    c.bench_function("new_host_with_child", |b| {
        b.iter(|| {
            black_box(
                manager
                    .on_host_save(
                        HostSave::new(HostTarget::new_host("node"), FIELD)
                            .child(ChildSpec::new(json!({"title": "x"}))),
                    )
                    .unwrap(),
            );
        });
    });
}

/// Benchmark journal replay on open
fn bench_reopen(c: &mut Criterion) {
    let mut group = c.benchmark_group("reopen");
    group.sample_size(20);

    for hosts in [10, 100] {
        let dir = TempDir::new().unwrap();
        {
            let manager = create_manager(&dir);
            for _ in 0..hosts {
                manager
                    .on_host_save(
                        HostSave::new(HostTarget::new_host("node"), FIELD)
                            .children((0..5).map(|n| ChildSpec::new(json!(n)))),
                    )
                    .unwrap();
            }
        }

        group.bench_with_input(BenchmarkId::new("hosts", hosts), &hosts, |b, _| {
            b.iter(|| {
                let store = Store::open(StoreConfig {
                    sync_every_commit: false,
                    ..StoreConfig::new(dir.path().join("store"))
                })
                .unwrap();
                black_box(store.stats());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_host_save, bench_new_host, bench_reopen);
criterion_main!(benches);
