use criterion::{black_box, criterion_group, criterion_main, Criterion};

use dmclock_queue::{PrioritizedQueue, Slo};

fn bench_dmclock(c: &mut Criterion) {
    let mut group = c.benchmark_group("dmclock");

    group.bench_function("enqueue_dequeue_cycle", |b| {
        let mut q = PrioritizedQueue::new(1000, 10);
        // Steady-state backlog across a handful of tenants.
        for cl in 0..8u32 {
            let slo = Slo::new(50, 0.1, 0);
            for _ in 0..64 {
                q.enqueue_dmclock(cl, slo, 1, cl);
            }
        }
        let mut next = 0u32;
        b.iter(|| {
            let slo = Slo::new(50, 0.1, 0);
            q.enqueue_dmclock(next % 8, slo, 1, next % 8);
            next = next.wrapping_add(1);
            black_box(q.dequeue());
        });
    });

    group.bench_function("snapshot", |b| {
        let mut q = PrioritizedQueue::new(1000, 10);
        for cl in 0..32u32 {
            q.enqueue_dmclock(cl, Slo::new(10, 0.02, 0), 1, cl);
        }
        b.iter(|| black_box(q.snapshot()));
    });

    group.finish();
}

fn bench_strict(c: &mut Criterion) {
    let mut group = c.benchmark_group("strict");

    group.bench_function("enqueue_dequeue_cycle", |b| {
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(1000, 10);
        for i in 0..256u32 {
            q.enqueue_strict(i % 4, (i % 3) as u64, i);
        }
        let mut next = 0u32;
        b.iter(|| {
            q.enqueue_strict(next % 4, (next % 3) as u64, next);
            next = next.wrapping_add(1);
            black_box(q.dequeue());
        });
    });

    group.finish();
}

fn bench_weighted(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted");

    group.bench_function("enqueue_dequeue_cycle", |b| {
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(1000, 10);
        for i in 0..256u32 {
            q.enqueue_weighted(i % 4, (i % 3 + 1) as u64, 20, i);
        }
        let mut next = 0u32;
        b.iter(|| {
            q.enqueue_weighted(next % 4, (next % 3 + 1) as u64, 20, next);
            next = next.wrapping_add(1);
            black_box(q.dequeue());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dmclock, bench_strict, bench_weighted);
criterion_main!(benches);
