use std::sync::Arc;
use std::time::Duration;

use common::{AggregateId, ProductId, RetryPolicy, SystemClock};
use criterion::{Criterion, criterion_group, criterion_main};
use inventory::{InMemoryLockService, InMemoryStockStore, LedgerConfig, StockLedger};

fn ledger() -> StockLedger {
    StockLedger::new(
        Arc::new(InMemoryLockService::default()),
        Arc::new(InMemoryStockStore::new()),
        Arc::new(SystemClock),
        LedgerConfig {
            lock_retry: RetryPolicy::new(100, Duration::from_millis(1)),
            ..LedgerConfig::default()
        },
    )
}

fn bench_reserve_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = ledger();
    let product = ProductId::new("bench-sku");
    rt.block_on(async { ledger.restock(&product, 1_000_000).await.unwrap() });

    c.bench_function("inventory/reserve_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let reservation = ledger
                    .reserve(&product, 1, AggregateId::new())
                    .await
                    .unwrap();
                ledger.release(reservation.reservation_id).await.unwrap();
            });
        });
    });
}

fn bench_reserve_confirm(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = ledger();
    let product = ProductId::new("bench-sku");
    rt.block_on(async { ledger.restock(&product, u32::MAX / 2).await.unwrap() });

    c.bench_function("inventory/reserve_confirm", |b| {
        b.iter(|| {
            rt.block_on(async {
                let reservation = ledger
                    .reserve(&product, 1, AggregateId::new())
                    .await
                    .unwrap();
                ledger.confirm(reservation.reservation_id).await.unwrap();
            });
        });
    });
}

fn bench_contended_reserve(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = Arc::new(ledger());
    let product = ProductId::new("bench-sku");
    rt.block_on(async { ledger.restock(&product, u32::MAX / 2).await.unwrap() });

    c.bench_function("inventory/contended_reserve_x8", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handles: Vec<_> = (0..8)
                    .map(|_| {
                        let ledger = ledger.clone();
                        let product = product.clone();
                        tokio::spawn(async move {
                            ledger.reserve(&product, 1, AggregateId::new()).await
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap().unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_release,
    bench_reserve_confirm,
    bench_contended_reserve
);
criterion_main!(benches);
