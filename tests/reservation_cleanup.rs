use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tempfile::TempDir;

use stockledger::{
    config::{InMemoryConfigurationProvider, StaticStockResolver, StockItemConfiguration},
    core::{
        index::{SourceDeduction, SourceQuantityIndex},
        ledger::{CleanupReport, LedgerConfig},
    },
    inventory::{Source, SourceItem, SourceLink, Stock},
    reservation::{ReservationBuilder, ReservationObject},
    service::{InventoryService, ServiceConfig},
    types::{AggregationMode, Quantity, SourceItemStatus},
};

fn open_seeded(tmp: &TempDir, qty: i64) -> InventoryService {
    open_seeded_with(tmp, qty, ServiceConfig::default())
}

fn open_seeded_with(tmp: &TempDir, qty: i64, config: ServiceConfig) -> InventoryService {
    let provider = Arc::new(InMemoryConfigurationProvider::new());
    provider.assign("A", 10, StockItemConfiguration::default());
    let service = InventoryService::open(
        tmp.path().join("inventory.db"),
        config,
        provider,
        Arc::new(StaticStockResolver::new()),
    )
    .expect("open service");

    let repo = service.repository();
    repo.save_source(&Source {
        source_code: "wh".into(),
        name: "Warehouse".into(),
        enabled: true,
    })
    .expect("source");
    repo.save_stock(&Stock {
        stock_id: 10,
        name: "Main".into(),
        aggregation: AggregationMode::Sum,
    })
    .expect("stock");
    repo.link_source(&SourceLink {
        stock_id: 10,
        source_code: "wh".into(),
        priority: 0,
    })
    .expect("link");
    repo.save_source_items(&[SourceItem {
        source_code: "wh".into(),
        sku: "A".into(),
        quantity: Quantity::whole(qty),
        status: SourceItemStatus::InStock,
    }])
    .expect("items");
    service.execute_full().expect("full reindex");
    service
}

fn reserve(service: &InventoryService, object: &ReservationObject, qty: f64) {
    let reservation = ReservationBuilder::new()
        .sku("A")
        .stock_id(10)
        .quantity(qty)
        .object(object.clone())
        .build()
        .expect("valid reservation");
    service.append_reservations(&[reservation]).expect("append");
}

fn indexed(service: &InventoryService) -> Quantity {
    SourceQuantityIndex::new(service.database().clone())
        .get("A", 10)
        .expect("index row")
        .map(|row| row.quantity)
        .unwrap_or(Quantity::ZERO)
}

#[test]
fn settled_orders_fold_into_the_index_once() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_seeded(&tmp, 10);
    let placed = ReservationObject::order("100");
    let open = ReservationObject::order("101");

    reserve(&service, &placed, -4.0);
    reserve(&service, &placed, -1.0);
    reserve(&service, &open, -2.0);
    let before = service.get_salable_quantity("A", 10).expect("salable");
    assert_eq!(before, Quantity::whole(3));

    service.ledger().settle(&placed).expect("settle");
    let report = service.cleanup_reservations().expect("cleanup");
    assert_eq!(
        report,
        CleanupReport {
            folded_pairs: 1,
            removed_rows: 2,
            pruned_settlements: 0,
        }
    );
    assert_eq!(indexed(&service), Quantity::whole(5));
    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::whole(-2));
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), before);

    let again = service.cleanup_reservations().expect("cleanup again");
    assert_eq!(again, CleanupReport::default());
    assert_eq!(indexed(&service), Quantity::whole(5));
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), before);
}

#[test]
fn settling_twice_does_not_fold_twice() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_seeded(&tmp, 10);
    let placed = ReservationObject::order("200");

    reserve(&service, &placed, -3.0);
    service.ledger().settle(&placed).expect("settle");
    service.ledger().settle(&placed).expect("settle again");
    service.cleanup_reservations().expect("cleanup");
    service.cleanup_reservations().expect("cleanup again");

    assert_eq!(indexed(&service), Quantity::whole(7));
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(7));
}

#[test]
fn released_quotes_are_dropped_without_touching_the_index() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_seeded(&tmp, 6);
    let quote = ReservationObject::quote("q-1");

    reserve(&service, &quote, -2.0);
    assert_eq!(service.ledger().release(&quote).expect("release"), 1);

    let report = service.cleanup_reservations().expect("cleanup");
    assert_eq!(report.folded_pairs, 0);
    assert_eq!(report.removed_rows, 2);
    assert_eq!(indexed(&service), Quantity::whole(6));
    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::ZERO);
    assert!(service.ledger().reservations_for(&quote).expect("rows").is_empty());
}

#[test]
fn rows_appended_after_settlement_fold_on_the_next_pass() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_seeded(&tmp, 10);
    let placed = ReservationObject::order("300");

    reserve(&service, &placed, -1.0);
    service.ledger().settle(&placed).expect("settle");
    service.cleanup_reservations().expect("cleanup");
    reserve(&service, &placed, 1.0);

    let report = service.cleanup_reservations().expect("cleanup");
    assert_eq!(report.folded_pairs, 1);
    assert_eq!(indexed(&service), Quantity::whole(10));
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(10));
}

fn add_store(service: &InventoryService) {
    let repo = service.repository();
    repo.save_source(&Source {
        source_code: "store".into(),
        name: "Store".into(),
        enabled: true,
    })
    .expect("source");
    repo.link_source(&SourceLink {
        stock_id: 10,
        source_code: "store".into(),
        priority: 1,
    })
    .expect("link");
}

#[test]
fn restocking_another_source_keeps_folded_settlements() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_seeded(&tmp, 10);
    add_store(&service);
    let placed = ReservationObject::order("400");

    reserve(&service, &placed, -4.0);
    service.ledger().settle(&placed).expect("settle");
    service.cleanup_reservations().expect("cleanup");
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(6));

    service
        .save_source_items(&[SourceItem {
            source_code: "store".into(),
            sku: "A".into(),
            quantity: Quantity::whole(1),
            status: SourceItemStatus::InStock,
        }])
        .expect("restock");
    assert_eq!(service.consumer().drain().expect("drain"), 1);
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(7));

    service.execute_full().expect("full reindex");
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(7));
    let row = SourceQuantityIndex::new(service.database().clone())
        .get("A", 10)
        .expect("read")
        .expect("row");
    assert_eq!(row.settled_delta, Quantity::whole(-4));
}

#[test]
fn shipping_from_a_source_consumes_the_settled_delta() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_seeded(&tmp, 10);
    let placed = ReservationObject::order("500");

    reserve(&service, &placed, -4.0);
    service.ledger().settle(&placed).expect("settle");
    service.cleanup_reservations().expect("cleanup");

    let stocks = service
        .deduct_source_items(&[SourceDeduction {
            stock_id: 10,
            source_code: "wh".into(),
            sku: "A".into(),
            quantity: Quantity::whole(4),
        }])
        .expect("deduct");
    assert_eq!(stocks, vec![10]);

    let stored = service.repository().get_source_item(1).expect("read").expect("item");
    assert_eq!(stored.item.quantity, Quantity::whole(6));
    let row = SourceQuantityIndex::new(service.database().clone())
        .get("A", 10)
        .expect("read")
        .expect("row");
    assert_eq!(row.settled_delta, Quantity::ZERO);
    assert_eq!(row.quantity, Quantity::whole(6));
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(6));

    service.execute_full().expect("full reindex");
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(6));

    assert!(service
        .deduct_source_items(&[SourceDeduction {
            stock_id: 10,
            source_code: "missing".into(),
            sku: "A".into(),
            quantity: Quantity::whole(1),
        }])
        .is_err());
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(6));
}

#[test]
fn settlement_markers_are_pruned_after_retention() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_seeded_with(
        &tmp,
        10,
        ServiceConfig {
            ledger: LedgerConfig {
                settlement_retention_ms: 0,
            },
            ..ServiceConfig::default()
        },
    );
    let placed = ReservationObject::order("600");

    reserve(&service, &placed, -2.0);
    service.ledger().settle(&placed).expect("settle");
    let report = service.cleanup_reservations().expect("cleanup");
    assert_eq!(
        report,
        CleanupReport {
            folded_pairs: 1,
            removed_rows: 1,
            pruned_settlements: 1,
        }
    );

    // The marker is gone, so a late row is an ordinary reservation again.
    reserve(&service, &placed, 2.0);
    let report = service.cleanup_reservations().expect("cleanup again");
    assert_eq!(report, CleanupReport::default());
    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::whole(2));
    assert_eq!(service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(10));
}

#[test]
fn readers_never_see_a_half_applied_cleanup() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_seeded(&tmp, 20);
    let orders: Vec<_> = (0..10).map(|i| ReservationObject::order(format!("7{i}"))).collect();
    for order in &orders {
        reserve(&service, order, -1.0);
    }
    let expected = service.get_salable_quantity("A", 10).expect("salable");
    assert_eq!(expected, Quantity::whole(10));

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0usize;
                while !done.load(Ordering::SeqCst) || reads == 0 {
                    let salable = service.get_salable_quantity("A", 10).expect("salable");
                    assert_eq!(salable, expected);
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for order in &orders {
        service.ledger().settle(order).expect("settle");
        service.cleanup_reservations().expect("cleanup");
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.join().expect("reader") > 0);
    }
    assert_eq!(indexed(&service), Quantity::whole(10));
    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::ZERO);
}
