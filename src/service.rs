//! One-stop facade wiring the ledger, index, pipeline and low-stock resolver
//! over a single database.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    config::{SalesChannel, StockItemConfigurationProvider, StockResolver},
    core::{
        index::{SourceDeduction, SourceQuantityIndex},
        ledger::{CleanupReport, LedgerConfig, ReservationError, ReservationLedger},
        low_stock::LowStockSignalResolver,
        salable::{SalableQuantityCalculator, SalableQuantityError},
    },
    inventory::{InventoryRepository, SourceItem, SourceItemsSave},
    persist::{Database, DatabaseConfig, PersistResult},
    queue::{MessageQueue, SqliteQueue},
    reservation::Reservation,
    runtime::{
        consumer::{ConsumerConfig, ConsumerHandle, SourceItemsConsumer, spawn_index_consumers},
        indexer::{IndexerError, IndexerMode, SourceItemIndexer},
    },
    types::{Quantity, SourceItemId, StockId},
};

/// Settings for [`InventoryService::open`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Connection settings.
    pub database: DatabaseConfig,
    /// Inline or queued partial reindex.
    pub indexer_mode: IndexerMode,
    /// Worker pool settings for [`InventoryService::spawn_consumers`].
    pub consumer: ConsumerConfig,
    /// Ledger housekeeping.
    pub ledger: LedgerConfig,
}

/// Published surface of the reservation and indexing engine.
#[derive(Clone)]
pub struct InventoryService {
    db: Database,
    repository: InventoryRepository,
    ledger: ReservationLedger,
    calculator: SalableQuantityCalculator,
    index: SourceQuantityIndex,
    indexer: SourceItemIndexer,
    low_stock: LowStockSignalResolver,
    consumer: ConsumerConfig,
}

impl std::fmt::Debug for InventoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryService")
            .field("db", &self.db)
            .field("indexer", &self.indexer)
            .finish_non_exhaustive()
    }
}

impl InventoryService {
    /// Opens the database at `path` and uses its own table as the reindex queue.
    pub fn open(
        path: impl AsRef<Path>,
        config: ServiceConfig,
        provider: Arc<dyn StockItemConfigurationProvider>,
        stocks: Arc<dyn StockResolver>,
    ) -> PersistResult<Self> {
        let db = Database::open_with(path, config.database.clone())?;
        let queue: Arc<dyn MessageQueue> = Arc::new(SqliteQueue::new(db.clone()));
        Ok(Self::with_queue(db, queue, config, provider, stocks))
    }

    /// Wires the components over an existing database and queue.
    pub fn with_queue(
        db: Database,
        queue: Arc<dyn MessageQueue>,
        config: ServiceConfig,
        provider: Arc<dyn StockItemConfigurationProvider>,
        stocks: Arc<dyn StockResolver>,
    ) -> Self {
        let calculator = SalableQuantityCalculator::new(db.clone(), Arc::clone(&provider));
        let index = SourceQuantityIndex::new(db.clone());
        let indexer = SourceItemIndexer::new(index.clone(), queue, config.indexer_mode);
        Self {
            repository: InventoryRepository::new(db.clone()),
            ledger: ReservationLedger::with_config(db.clone(), Arc::clone(&provider), config.ledger),
            low_stock: LowStockSignalResolver::new(stocks, provider, calculator.clone()),
            calculator,
            index,
            indexer,
            consumer: config.consumer,
            db,
        }
    }

    /// Shared database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Topology tables.
    pub fn repository(&self) -> &InventoryRepository {
        &self.repository
    }

    /// Reservation ledger, for release/settle and per-object queries.
    pub fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    /// Indexer, for state inspection and event subscription.
    pub fn indexer(&self) -> &SourceItemIndexer {
        &self.indexer
    }

    /// Appends reservation deltas atomically.
    pub fn append_reservations(&self, reservations: &[Reservation]) -> Result<(), ReservationError> {
        self.ledger.append(reservations)
    }

    /// Appends reservation deltas only if no pair would be oversold.
    pub fn reserve(&self, reservations: &[Reservation]) -> Result<(), ReservationError> {
        self.ledger.reserve(reservations)
    }

    /// Sum of all ledger deltas of a pair.
    pub fn reservations_sum(&self, sku: &str, stock_id: StockId) -> PersistResult<Quantity> {
        self.ledger.reservations_sum(sku, stock_id)
    }

    /// Folds settled reservations into the index.
    pub fn cleanup_reservations(&self) -> PersistResult<CleanupReport> {
        self.ledger.cleanup()
    }

    /// Lowers source items by shipped quantity, consuming folded settlements.
    pub fn deduct_source_items(&self, deductions: &[SourceDeduction]) -> PersistResult<Vec<StockId>> {
        self.index.deduct(deductions)
    }

    /// Indexed quantity plus ledger sum.
    pub fn get_salable_quantity(&self, sku: &str, stock_id: StockId) -> Result<Quantity, SalableQuantityError> {
        self.calculator.get_salable_quantity(sku, stock_id)
    }

    /// True when `requested` can be sold now.
    pub fn is_salable(&self, sku: &str, stock_id: StockId, requested: Quantity) -> bool {
        self.calculator.is_salable(sku, stock_id, requested)
    }

    /// Rebuilds the whole index.
    pub fn execute_full(&self) -> Result<usize, IndexerError> {
        self.indexer.execute_full()
    }

    /// Reindexes one source item.
    pub fn execute_row(&self, id: SourceItemId) -> Result<(), IndexerError> {
        self.indexer.execute_row(id)
    }

    /// Reindexes a list of source items.
    pub fn execute_list(&self, ids: &[SourceItemId]) -> Result<(), IndexerError> {
        self.indexer.execute_list(ids)
    }

    /// Saves source items and triggers their reindex.
    pub fn save_source_items(&self, items: &[SourceItem]) -> Result<Vec<SourceItemId>, IndexerError> {
        SourceItemsSave::new(self.repository.clone(), self.indexer.clone()).execute(items)
    }

    /// "Only X left" quantity for `sku` on `channel`.
    pub fn get_only_x_left_qty(&self, sku: &str, channel: &SalesChannel) -> Option<Quantity> {
        self.low_stock.get_only_x_left_qty(sku, channel)
    }

    /// A consumer bound to this service's index and queue.
    pub fn consumer(&self) -> SourceItemsConsumer {
        self.indexer.consumer(self.consumer.clone())
    }

    /// Starts the consumer worker pool. Must be called inside a tokio runtime.
    pub fn spawn_consumers(&self) -> ConsumerHandle {
        spawn_index_consumers(self.consumer())
    }
}
