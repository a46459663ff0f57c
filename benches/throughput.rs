use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use stockledger::{
    config::{InMemoryConfigurationProvider, StaticStockResolver, StockItemConfiguration},
    reservation::{Reservation, ReservationBuilder, ReservationObject},
    runtime::indexer::IndexerMode,
    service::{InventoryService, ServiceConfig},
};

fn open_service(tmp: &TempDir) -> InventoryService {
    let provider = Arc::new(InMemoryConfigurationProvider::new());
    for sku in 0..100 {
        provider.assign(format!("SKU-{sku}"), 1, StockItemConfiguration::default());
    }
    InventoryService::open(
        tmp.path().join("bench.db"),
        ServiceConfig {
            indexer_mode: IndexerMode::Sync,
            ..ServiceConfig::default()
        },
        provider,
        Arc::new(StaticStockResolver::new()),
    )
    .expect("open service")
}

fn hold(sku: u64, order: u64) -> Reservation {
    ReservationBuilder::new()
        .sku(format!("SKU-{sku}"))
        .stock_id(1)
        .quantity(-1.0)
        .object(ReservationObject::order(order.to_string()))
        .build()
        .expect("reservation")
}

fn bench_appends(c: &mut Criterion) {
    let tmp = TempDir::new().expect("tmp");
    let service = open_service(&tmp);
    let mut order = 0u64;

    let mut group = c.benchmark_group("append_batch");
    for n in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let batch: Vec<_> = (0..n as u64)
                    .map(|i| {
                        order += 1;
                        hold(i % 100, order)
                    })
                    .collect();
                service.append_reservations(&batch).expect("append");
            });
        });
    }
    group.finish();
}

fn bench_salable_reads(c: &mut Criterion) {
    let tmp = TempDir::new().expect("tmp");
    let service = open_service(&tmp);
    for order in 0..20_000u64 {
        service
            .append_reservations(&[hold(order % 100, order)])
            .expect("append");
    }

    c.bench_function("reservations_sum_200_rows", |b| {
        b.iter(|| {
            let _ = service.reservations_sum("SKU-7", 1).expect("sum");
        });
    });
    c.bench_function("get_salable_quantity", |b| {
        b.iter(|| {
            let _ = service.get_salable_quantity("SKU-7", 1).expect("salable");
        });
    });
}

criterion_group!(benches, bench_appends, bench_salable_reads);
criterion_main!(benches);
