//! Benchmarks for the event queue's scheduling hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use blis::clock::Tick;
use blis::event::{EventKind, EventPayload, EventQueue};

fn bench_schedule_10k_events(c: &mut Criterion) {
    c.bench_function("schedule_10k_instance_events", |b| {
        b.iter(|| {
            let mut q = EventQueue::new();
            for i in 0..10_000u64 {
                q.schedule(
                    Tick(i % 1000),
                    EventKind::Step((i % 8) as usize),
                    Some(i),
                    EventPayload::default(),
                );
            }
            black_box(q.len());
        })
    });
}

fn bench_drain_10k_events(c: &mut Criterion) {
    c.bench_function("drain_10k_mixed_events", |b| {
        b.iter_batched(
            || {
                let mut q = EventQueue::new();
                for i in 0..10_000u64 {
                    let kind = match i % 4 {
                        0 => EventKind::Admission,
                        1 => EventKind::Routing,
                        2 => EventKind::Dispatch,
                        _ => EventKind::Step((i % 8) as usize),
                    };
                    q.schedule(Tick(i % 1000), kind, Some(i), EventPayload::default());
                }
                q
            },
            |mut q| {
                while let Some(ev) = q.pop() {
                    black_box(ev);
                }
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_schedule_10k_events, bench_drain_10k_events);
criterion_main!(benches);
