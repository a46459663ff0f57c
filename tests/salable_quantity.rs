use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use stockledger::{
    config::{InMemoryConfigurationProvider, StaticStockResolver, StockItemConfiguration},
    core::{
        ledger::ReservationError,
        salable::{SalableQuantityCalculator, SalableQuantityError},
    },
    inventory::{Source, SourceItem, SourceLink, Stock},
    reservation::{Reservation, ReservationBuilder, ReservationObject},
    runtime::indexer::IndexerMode,
    service::{InventoryService, ServiceConfig},
    types::{AggregationMode, BackorderPolicy, Quantity, SourceItemStatus, StockId},
};

struct Fixture {
    _tmp: TempDir,
    provider: Arc<InMemoryConfigurationProvider>,
    service: InventoryService,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().expect("tmp");
    let provider = Arc::new(InMemoryConfigurationProvider::new());
    provider.assign("A", 10, StockItemConfiguration::default());
    let service = InventoryService::open(
        tmp.path().join("inventory.db"),
        ServiceConfig {
            indexer_mode: IndexerMode::Sync,
            ..ServiceConfig::default()
        },
        provider.clone(),
        Arc::new(StaticStockResolver::new()),
    )
    .expect("open service");
    Fixture {
        _tmp: tmp,
        provider,
        service,
    }
}

fn seed(service: &InventoryService, sku: &str, stock_id: StockId, qty: f64) {
    let repo = service.repository();
    repo.save_source(&Source {
        source_code: "default".into(),
        name: "Default".into(),
        enabled: true,
    })
    .expect("source");
    repo.save_stock(&Stock {
        stock_id,
        name: format!("Stock {stock_id}"),
        aggregation: AggregationMode::Sum,
    })
    .expect("stock");
    repo.link_source(&SourceLink {
        stock_id,
        source_code: "default".into(),
        priority: 1,
    })
    .expect("link");
    service
        .save_source_items(&[SourceItem {
            source_code: "default".into(),
            sku: sku.into(),
            quantity: Quantity::from_f64(qty).expect("qty"),
            status: SourceItemStatus::InStock,
        }])
        .expect("save items");
}

fn hold(qty: f64, order: &str) -> Reservation {
    ReservationBuilder::new()
        .sku("A")
        .stock_id(10)
        .quantity(qty)
        .object(ReservationObject::order(order))
        .build()
        .expect("valid reservation")
}

#[test]
fn salable_is_index_plus_ledger_and_oversell_is_rejected() {
    let fx = fixture();
    seed(&fx.service, "A", 10, 5.5);
    assert_eq!(
        fx.service.get_salable_quantity("A", 10).expect("salable"),
        Quantity::from_raw(55_000)
    );

    fx.service.append_reservations(&[hold(-4.0, "1")]).expect("append");
    assert_eq!(fx.service.reservations_sum("A", 10).expect("sum"), Quantity::whole(-4));
    assert_eq!(
        fx.service.get_salable_quantity("A", 10).expect("salable"),
        Quantity::from_raw(15_000)
    );

    assert!(!fx.service.is_salable("A", 10, Quantity::whole(4)));
    let err = fx.service.reserve(&[hold(-4.0, "2")]).expect_err("oversell");
    match err {
        ReservationError::InsufficientQuantity {
            salable, requested, ..
        } => {
            assert_eq!(salable, Quantity::from_raw(15_000));
            assert_eq!(requested, Quantity::whole(4));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.service.reservations_sum("A", 10).expect("sum"), Quantity::whole(-4));

    fx.service.reserve(&[hold(-1.5, "3")]).expect("exact fit");
    assert_eq!(fx.service.get_salable_quantity("A", 10).expect("salable"), Quantity::ZERO);
}

#[test]
fn breakdown_matches_salable_for_every_step() {
    let fx = fixture();
    seed(&fx.service, "A", 10, 8.0);
    let calculator = SalableQuantityCalculator::new(
        fx.service.database().clone(),
        fx.provider.clone(),
    );

    for (i, qty) in [-1.0, -2.5, 0.5, -0.25].into_iter().enumerate() {
        fx.service
            .append_reservations(&[hold(qty, &i.to_string())])
            .expect("append");
        let breakdown = calculator.breakdown("A", 10).expect("breakdown");
        assert_eq!(breakdown.reserved, fx.service.reservations_sum("A", 10).expect("sum"));
        assert_eq!(breakdown.indexed, Quantity::whole(8));
        assert_eq!(
            breakdown.salable(),
            fx.service.get_salable_quantity("A", 10).expect("salable")
        );
    }
    assert_eq!(
        fx.service.get_salable_quantity("A", 10).expect("salable"),
        Quantity::from_raw(47_500)
    );
}

#[test]
fn unknown_pairs_are_not_found() {
    let fx = fixture();
    fx.provider.register_stock(20);

    assert!(matches!(
        fx.service.get_salable_quantity("A", 99),
        Err(SalableQuantityError::StockNotFound(99))
    ));
    assert!(matches!(
        fx.service.get_salable_quantity("A", 20),
        Err(SalableQuantityError::SkuNotAssignedToStock { stock_id: 20, .. })
    ));
    assert_eq!(fx.service.get_salable_quantity("A", 10).expect("salable"), Quantity::ZERO);
}

#[test]
fn is_salable_requires_positive_request_and_known_pair() {
    let fx = fixture();
    seed(&fx.service, "A", 10, 3.0);

    assert!(fx.service.is_salable("A", 10, Quantity::whole(3)));
    assert!(!fx.service.is_salable("A", 10, Quantity::from_raw(30_001)));
    assert!(!fx.service.is_salable("A", 10, Quantity::ZERO));
    assert!(!fx.service.is_salable("A", 10, Quantity::whole(-1)));
    assert!(!fx.service.is_salable("A", 99, Quantity::whole(1)));
}

#[test]
fn backorders_allow_selling_past_zero() {
    let fx = fixture();
    seed(&fx.service, "A", 10, 1.0);
    fx.provider.assign(
        "A",
        10,
        StockItemConfiguration {
            backorders: BackorderPolicy::AllowQty,
            ..StockItemConfiguration::default()
        },
    );

    assert!(fx.service.is_salable("A", 10, Quantity::whole(5)));
    fx.service.reserve(&[hold(-5.0, "1")]).expect("backordered");
    assert_eq!(fx.service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(-4));

    fx.provider.assign(
        "A",
        10,
        StockItemConfiguration {
            backorders: BackorderPolicy::AllowQtyAndNotify,
            ..StockItemConfiguration::default()
        },
    );
    assert!(!fx.service.is_salable("A", 10, Quantity::whole(1)));
}

#[test]
fn releases_always_pass_the_conditional_append() {
    let fx = fixture();
    fx.service.reserve(&[hold(2.0, "refund")]).expect("positive delta");
    assert_eq!(fx.service.get_salable_quantity("A", 10).expect("salable"), Quantity::whole(2));
}

#[test]
fn concurrent_reserves_never_oversell() {
    let fx = fixture();
    seed(&fx.service, "A", 10, 10.0);

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let service = fx.service.clone();
            thread::spawn(move || {
                (0..5)
                    .map(|i| service.reserve(&[hold(-1.0, &format!("{t}-{i}"))]))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in threads {
        for result in handle.join().expect("join") {
            match result {
                Ok(()) => accepted += 1,
                Err(ReservationError::InsufficientQuantity { requested, .. }) => {
                    assert_eq!(requested, Quantity::whole(1));
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }

    assert_eq!(accepted, 10);
    assert_eq!(fx.service.reservations_sum("A", 10).expect("sum"), Quantity::whole(-10));
    assert_eq!(fx.service.get_salable_quantity("A", 10).expect("salable"), Quantity::ZERO);
}
