use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lbpool::balance::{IdleRing, Popped, WarmupSchedule};
use std::time::Duration;
use tokio::time::Instant;

fn bench_free_then_recycle(c: &mut Criterion) {
    let mut ring: IdleRing<u64> = IdleRing::new(64, 16);
    let max_idle = Duration::from_secs(10);

    c.bench_function("idle_ring_push_pop", |b| {
        b.iter(|| {
            let now = Instant::now();
            let _ = ring.push(black_box(7), now);
            match ring.pop_newest(now, max_idle) {
                Popped::Fresh(item) | Popped::Expired(item) => {
                    black_box(item);
                }
                Popped::Empty => {}
            }
        });
    });
}

fn bench_evict_expired(c: &mut Criterion) {
    let max_idle = Duration::from_millis(1);

    c.bench_function("idle_ring_evict_full", |b| {
        b.iter(|| {
            let mut ring: IdleRing<u64> = IdleRing::new(64, 63);
            let then = Instant::now();
            for i in 0..63 {
                let _ = ring.push(i, then);
            }
            let later = then + Duration::from_millis(5);
            black_box(ring.evict_expired(later, max_idle));
        });
    });
}

fn bench_warmup_admission(c: &mut Criterion) {
    let schedule = WarmupSchedule::new(Duration::from_secs(60), Duration::from_secs(15));

    c.bench_function("warmup_admission", |b| {
        b.iter(|| {
            for ms in (0..60_000u64).step_by(3_750) {
                black_box(schedule.admission(Some(Duration::from_millis(ms)), black_box(2)));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_free_then_recycle,
    bench_evict_expired,
    bench_warmup_admission
);
criterion_main!(benches);
