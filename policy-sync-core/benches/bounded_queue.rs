use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use policy_sync_core::queue::BoundedQueue;

fn try_put_try_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_queue");
    for capacity in [64usize, 1024, 16_384] {
        group.bench_with_input(
            BenchmarkId::new("fill_then_drain", capacity),
            &capacity,
            |b, &capacity| {
                let queue = BoundedQueue::new(capacity);
                b.iter(|| {
                    for i in 0..capacity {
                        let _ = queue.try_put(black_box(i));
                    }
                    while let Some(item) = queue.try_get() {
                        black_box(item);
                    }
                });
            },
        );
    }
    group.finish();
}

fn drain_batches(c: &mut Criterion) {
    let queue = BoundedQueue::new(1024);
    c.bench_function("bounded_queue/drain_up_to_32", |b| {
        b.iter(|| {
            for i in 0..256u32 {
                let _ = queue.try_put(i);
            }
            while !queue.is_empty() {
                black_box(queue.drain_up_to(32));
            }
        });
    });
}

criterion_group!(benches, try_put_try_get, drain_batches);
criterion_main!(benches);
