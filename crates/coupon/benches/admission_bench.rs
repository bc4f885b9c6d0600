use std::sync::Arc;

use common::{CouponId, UserId};
use coupon::ReservationCounter;
use criterion::{Criterion, criterion_group, criterion_main};
use store::InMemoryAtomicStore;

fn bench_reserve(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("admission/reserve", |b| {
        b.iter(|| {
            rt.block_on(async {
                let admission = ReservationCounter::new(Arc::new(InMemoryAtomicStore::new()));
                admission.reserve(CouponId::new(), 1000).await.unwrap();
            });
        });
    });
}

fn bench_full_admission_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("admission/reserve_mark_enqueue", |b| {
        b.iter(|| {
            rt.block_on(async {
                let admission = ReservationCounter::new(Arc::new(InMemoryAtomicStore::new()));
                let coupon_id = CouponId::new();
                let user_id = UserId::new();

                let sequence = admission.reserve(coupon_id, 1000).await.unwrap().unwrap();
                admission
                    .check_and_mark_issued(coupon_id, user_id)
                    .await
                    .unwrap();
                admission.enqueue(coupon_id, user_id, sequence).await.unwrap();
            });
        });
    });
}

fn bench_contended_counter(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("admission/reserve_100_contenders", |b| {
        b.iter(|| {
            rt.block_on(async {
                let admission = ReservationCounter::new(Arc::new(InMemoryAtomicStore::new()));
                let coupon_id = CouponId::new();

                let mut tasks = Vec::with_capacity(100);
                for _ in 0..100 {
                    let admission = admission.clone();
                    tasks.push(tokio::spawn(async move {
                        admission.reserve(coupon_id, 50).await.unwrap()
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve,
    bench_full_admission_pipeline,
    bench_contended_counter
);
criterion_main!(benches);
