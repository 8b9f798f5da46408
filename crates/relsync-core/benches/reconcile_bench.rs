//! # Reconciliation Benchmarks
//!
//! Delta computation, full apply against the in-memory store, and chunk
//! extraction throughput.
//!
//! Run with: `cargo bench -p relsync-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use relsync_core::bulk::{Chunk, extract_chunk};
use relsync_core::{
    ActorKey, EdgeAttrs, Event, EventId, Kind, MemoryGraph, Reconciler, RelationRegistry,
    compute_delta,
};
use std::collections::{BTreeMap, BTreeSet};
use std::hint::black_box;

fn follow_list(id: &str, at: u64, targets: impl Iterator<Item = usize>) -> Event {
    Event {
        id: EventId::parse(id).expect("id"),
        actor: ActorKey::parse("source").expect("actor"),
        kind: Kind(3),
        created_at: at,
        tags: targets
            .map(|t| vec!["p".to_string(), format!("t{t}")])
            .collect(),
    }
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_compute_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_delta");

    for size in [100usize, 1000, 10000].iter() {
        // Half overlap between current and target.
        let current: BTreeSet<ActorKey> = (0..*size)
            .map(|i| ActorKey::parse(format!("t{i}")).expect("key"))
            .collect();
        let target: BTreeMap<ActorKey, EdgeAttrs> = (size / 2..size + size / 2)
            .map(|i| (ActorKey::parse(format!("t{i}")).expect("key"), EdgeAttrs::new(1, None)))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(compute_delta(&target, &current)));
        });
    }

    group.finish();
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_follow_list");
    let engine = Reconciler::default();

    for size in [100usize, 1000, 5000].iter() {
        let before = follow_list("e1", 1, 0..*size);
        let after = follow_list("e2", 2, size / 10..size + size / 10);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut graph = MemoryGraph::new();
                engine.reconcile_event(&mut graph, &before).expect("before");
                black_box(engine.reconcile_event(&mut graph, &after).expect("after"))
            });
        });
    }

    group.finish();
}

fn bench_extract_chunk(c: &mut Criterion) {
    let registry = RelationRegistry::default();
    let lines: Vec<Vec<u8>> = (0..10_000)
        .map(|i| {
            let event = follow_list(&format!("e{i}"), i, (i as usize)..(i as usize + 20));
            serde_json::to_vec(&event).expect("encode")
        })
        .collect();

    c.bench_function("extract_chunk_10k", |b| {
        b.iter(|| {
            let chunk = Chunk {
                index: 0,
                lines: lines.clone(),
            };
            black_box(extract_chunk(&registry, chunk).expect("extract"))
        });
    });
}

criterion_group!(benches, bench_compute_delta, bench_reconcile, bench_extract_chunk);
criterion_main!(benches);
