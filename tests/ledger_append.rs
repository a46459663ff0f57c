use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use tempfile::TempDir;

use stockledger::{
    config::{InMemoryConfigurationProvider, StaticStockResolver, StockItemConfiguration},
    core::ledger::ReservationError,
    reservation::{ObjectType, Reservation, ReservationBuilder, ReservationObject, ValidationError},
    service::{InventoryService, ServiceConfig},
    types::{Quantity, StockId},
};

fn open_service(tmp: &TempDir) -> InventoryService {
    let provider = Arc::new(InMemoryConfigurationProvider::new());
    provider.assign("A", 10, StockItemConfiguration::default());
    provider.assign("B", 10, StockItemConfiguration::default());
    provider.register_stock(20);
    InventoryService::open(
        tmp.path().join("inventory.db"),
        ServiceConfig::default(),
        provider,
        Arc::new(StaticStockResolver::new()),
    )
    .expect("open service")
}

fn hold(sku: &str, stock_id: StockId, qty: f64, order: &str) -> Reservation {
    ReservationBuilder::new()
        .sku(sku)
        .stock_id(stock_id)
        .quantity(qty)
        .object(ReservationObject::order(order))
        .build()
        .expect("valid reservation")
}

#[test]
fn empty_ledger_sums_to_zero() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_service(&tmp);
    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::ZERO);
}

#[test]
fn appended_rows_are_summed_per_pair() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_service(&tmp);

    service
        .append_reservations(&[hold("A", 10, -4.0, "1"), hold("B", 10, -1.25, "1")])
        .expect("append");
    service
        .append_reservations(&[hold("A", 10, -0.5, "2")])
        .expect("append");

    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::from_raw(-45_000));
    assert_eq!(service.reservations_sum("B", 10).expect("sum"), Quantity::from_raw(-12_500));

    let rows = service
        .ledger()
        .reservations_for(&ReservationObject::order("1"))
        .expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(rows[0].reservation_id < rows[1].reservation_id);
    assert_eq!(rows[0].reservation.object.object_type, ObjectType::Order);
}

#[test]
fn unassigned_pair_rejects_the_whole_batch() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_service(&tmp);

    let batch = [hold("A", 10, -1.0, "1"), hold("C", 10, -1.0, "1")];
    let err = service.append_reservations(&batch).expect_err("unassigned sku");
    assert!(matches!(
        err,
        ReservationError::Validation(ValidationError::SkuNotAssignedToStock { ref sku, stock_id: 10 }) if sku == "C"
    ));
    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::ZERO);

    let err = service
        .append_reservations(&[hold("A", 99, -1.0, "1")])
        .expect_err("unknown stock");
    assert!(matches!(
        err,
        ReservationError::Validation(ValidationError::SkuNotAssignedToStock { stock_id: 99, .. })
    ));

    let err = service
        .append_reservations(&[hold("A", 20, -1.0, "1")])
        .expect_err("sku not on stock");
    assert!(matches!(
        err,
        ReservationError::Validation(ValidationError::SkuNotAssignedToStock { stock_id: 20, .. })
    ));
}

#[test]
fn builder_rejects_malformed_reservations() {
    assert_eq!(
        ReservationBuilder::new().stock_id(10).quantity(-1.0).build(),
        Err(ValidationError::EmptySku)
    );
    assert_eq!(
        ReservationBuilder::new().sku("A").quantity(-1.0).build(),
        Err(ValidationError::MissingStock { sku: "A".into() })
    );
    for qty in [0.0, f64::NAN, f64::INFINITY] {
        assert_eq!(
            ReservationBuilder::new().sku("A").stock_id(10).quantity(qty).build(),
            Err(ValidationError::InvalidQuantity { sku: "A".into() })
        );
    }
    assert_eq!(
        ReservationBuilder::new().sku("A").stock_id(10).build(),
        Err(ValidationError::InvalidQuantity { sku: "A".into() })
    );
}

#[test]
fn hand_built_zero_delta_is_rejected_on_append() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_service(&tmp);

    let zero = Reservation {
        sku: "A".into(),
        stock_id: 10,
        quantity: Quantity::ZERO,
        object: ReservationObject::default(),
    };
    let err = service.append_reservations(&[zero]).expect_err("zero delta");
    assert!(matches!(
        err,
        ReservationError::Validation(ValidationError::InvalidQuantity { .. })
    ));
}

#[test]
fn concurrent_appends_are_never_lost() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_service(&tmp);

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let service = service.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let order = format!("{t}-{i}");
                    service
                        .append_reservations(&[hold("A", 10, -1.0, &order)])
                        .expect("append");
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().expect("join");
    }

    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::whole(-200));
}

#[test]
fn release_appends_one_compensation_per_pair() {
    let tmp = TempDir::new().expect("tmp");
    let service = open_service(&tmp);
    let quote = ReservationObject::quote("q-7");

    let rows: Vec<_> = [-3.0, -1.0]
        .into_iter()
        .map(|qty| {
            ReservationBuilder::new()
                .sku("A")
                .stock_id(10)
                .quantity(qty)
                .object(quote.clone())
                .build()
                .expect("valid")
        })
        .collect();
    service.append_reservations(&rows).expect("append");
    service
        .append_reservations(&[hold("A", 10, -2.0, "other")])
        .expect("append");

    assert_eq!(service.ledger().release(&quote).expect("release"), 1);
    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::whole(-2));

    let rows = service.ledger().reservations_for(&quote).expect("rows");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].reservation.quantity, Quantity::whole(4));

    assert_eq!(service.ledger().release(&quote).expect("release again"), 0);
    assert_eq!(service.reservations_sum("A", 10).expect("sum"), Quantity::whole(-2));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn sum_is_independent_of_append_order(
        halves in prop::collection::vec(-40i64..40, 1..20),
        rotate in 0usize..20,
    ) {
        let deltas: Vec<i64> = halves.into_iter().filter(|h| *h != 0).collect();
        prop_assume!(!deltas.is_empty());
        let expected: Quantity = deltas.iter().map(|h| Quantity::from_raw(h * 5_000)).sum();

        let mut reordered = deltas.clone();
        reordered.rotate_left(rotate % deltas.len());
        reordered.reverse();

        for order in [&deltas, &reordered] {
            let tmp = TempDir::new().expect("tmp");
            let service = open_service(&tmp);
            for (i, half) in order.iter().enumerate() {
                service
                    .append_reservations(&[hold("A", 10, *half as f64 / 2.0, &i.to_string())])
                    .expect("append");
            }
            prop_assert_eq!(service.reservations_sum("A", 10).expect("sum"), expected);
        }
    }
}
