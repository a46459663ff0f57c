//! Salable-quantity reservations over an append-only ledger, with a SQLite
//! backed index of physical source quantities and a queued reindex pipeline.
//!
//! # Examples
//!
//! Fixed-point quantities and the low-stock rule need no database:
//! ```
//! use stockledger::{config::StockItemConfiguration, core::low_stock::only_x_left, types::Quantity};
//!
//! let config = StockItemConfiguration {
//!     stock_threshold_qty: Quantity::whole(5),
//!     ..StockItemConfiguration::default()
//! };
//! assert_eq!(only_x_left(Quantity::whole(5), &config), Some(Quantity::whole(5)));
//! assert_eq!(only_x_left(Quantity::whole(6), &config), None);
//! ```
//!
//! Full service with an async reindex pipeline:
//! ```no_run
//! use std::sync::Arc;
//!
//! use stockledger::{
//!     config::{InMemoryConfigurationProvider, StaticStockResolver, StockItemConfiguration},
//!     reservation::{ReservationBuilder, ReservationObject},
//!     service::{InventoryService, ServiceConfig},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let provider = Arc::new(InMemoryConfigurationProvider::new());
//! provider.register_stock(10);
//! provider.assign("A", 10, StockItemConfiguration::default());
//!
//! let service = InventoryService::open(
//!     "inventory.db",
//!     ServiceConfig::default(),
//!     provider,
//!     Arc::new(StaticStockResolver::new()),
//! )
//! .expect("open");
//! let consumers = service.spawn_consumers();
//!
//! let hold = ReservationBuilder::new()
//!     .sku("A")
//!     .stock_id(10)
//!     .quantity(-4.0)
//!     .object(ReservationObject::order("100001"))
//!     .build()
//!     .expect("valid reservation");
//! service.reserve(&[hold]).expect("reserve");
//! println!("salable: {}", service.get_salable_quantity("A", 10).expect("salable"));
//!
//! consumers.shutdown().await;
//! # }
//! ```
#![deny(missing_docs)]

/// Stock item configuration and sales-channel resolution.
pub mod config;
/// Ledger, index, salable quantity and low-stock rules.
pub mod core;
/// Sources, stocks, links and source items.
pub mod inventory;
/// SQLite persistence shared by every component.
pub mod persist;
/// Durable message queue for reindex requests.
pub mod queue;
/// Reservation records and their builder.
pub mod reservation;
/// Async reindex producer, consumers and events.
pub mod runtime;
/// Facade exposing the published operations.
pub mod service;
/// Shared primitive types and enums.
pub mod types;
