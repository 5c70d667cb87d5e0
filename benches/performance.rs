//! Performance benchmarks for fan-out, the in-process store and channels.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use herald::{
    Channel, ChannelConfig, CollectionOptions, DocumentStore, EntryId, Fanout, LogEntry,
    MemoryStore, NewEntry,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Benchmark dispatching one entry with varying listener counts
fn bench_fanout_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_dispatch");

    for listeners in [1, 10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("listeners", listeners),
            &listeners,
            |b, &count| {
                let fanout = Arc::new(Fanout::new());
                let hits = Arc::new(AtomicUsize::new(0));
                let mut subscriptions = Vec::with_capacity(count);
                for i in 0..count {
                    let hits = Arc::clone(&hits);
                    // Half on the event, half on the wildcard.
                    let event = if i % 2 == 0 { "tick" } else { "message" };
                    subscriptions.push(fanout.subscribe(
                        event,
                        Arc::new(move |_: &Value| {
                            hits.fetch_add(1, Ordering::Relaxed);
                        }),
                    ));
                }

                let entry = LogEntry {
                    id: EntryId(1),
                    event: Some("tick".to_string()),
                    message: Some(json!({"n": 1})),
                    expire_at: None,
                };

                b.iter(|| black_box(fanout.dispatch(&entry)));
            },
        );
    }

    group.finish();
}

/// Benchmark appends to bounded (rotating) and unbounded collections
fn bench_store_insert(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("store_insert");

    for (label, options) in [
        ("unbounded", CollectionOptions::unbounded()),
        ("bounded_100", CollectionOptions::bounded(1_000_000, Some(100))),
    ] {
        group.bench_function(label, |b| {
            let store = MemoryStore::new();
            rt.block_on(store.create_collection("bench", options.clone()))
                .unwrap();
            let message = json!({"user": "alice", "action": "login"});

            b.iter(|| {
                let entry = NewEntry::message("event", message.clone());
                black_box(rt.block_on(store.insert("bench", entry)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark publish-to-delivery latency through a channel
fn bench_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("round_trip");

    for (label, config) in [
        ("change_feed", ChannelConfig::new("rt")),
        ("bounded_log", ChannelConfig::new("rt").bounded(1_000_000, Some(1000))),
    ] {
        group.bench_function(label, |b| {
            let store = Arc::new(MemoryStore::new());
            let channel = rt.block_on(Channel::open(config.clone(), store)).unwrap();
            let delivered = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&delivered);
            channel
                .subscribe("ping", move |_| {
                    counter.fetch_add(1, Ordering::Release);
                })
                .unwrap();

            b.iter(|| {
                let before = delivered.load(Ordering::Acquire);
                rt.block_on(channel.publish("ping", &json!(1))).unwrap();
                while delivered.load(Ordering::Acquire) == before {
                    std::hint::spin_loop();
                }
            });

            channel.close();
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fanout_dispatch,
    bench_store_insert,
    bench_round_trip,
);

criterion_main!(benches);
