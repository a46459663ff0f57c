//! Salable quantity: indexed physical quantity plus the reservation ledger sum.

use std::sync::Arc;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{ConfigurationError, StockItemConfigurationProvider},
    persist::{Database, PersistError, PersistResult},
    types::{BackorderPolicy, Quantity, StockId},
};

/// The two components of a salable quantity, read from one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalableBreakdown {
    /// Cached physical quantity.
    pub indexed: Quantity,
    /// Sum of all ledger deltas.
    pub reserved: Quantity,
}

impl SalableBreakdown {
    /// `indexed + reserved`; the only place the formula is spelled out.
    pub fn salable(&self) -> Quantity {
        self.indexed + self.reserved
    }
}

/// Read-side failures.
#[derive(Debug, thiserror::Error)]
pub enum SalableQuantityError {
    /// The stock is unknown.
    #[error("stock {0} not found")]
    StockNotFound(StockId),
    /// The sku is not assigned to the stock.
    #[error("sku {sku} is not assigned to stock {stock_id}")]
    SkuNotAssignedToStock {
        /// Requested sku.
        sku: String,
        /// Requested stock.
        stock_id: StockId,
    },
    /// Configuration could not be loaded.
    #[error("configuration unavailable: {0}")]
    Configuration(ConfigurationError),
    /// Storage failure.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl From<ConfigurationError> for SalableQuantityError {
    fn from(value: ConfigurationError) -> Self {
        match value {
            ConfigurationError::StockNotFound(stock_id) => Self::StockNotFound(stock_id),
            ConfigurationError::SkuNotAssignedToStock { sku, stock_id } => {
                Self::SkuNotAssignedToStock { sku, stock_id }
            }
            other => Self::Configuration(other),
        }
    }
}

/// Answers "how much of a sku can be sold on a stock".
#[derive(Clone)]
pub struct SalableQuantityCalculator {
    db: Database,
    config: Arc<dyn StockItemConfigurationProvider>,
}

impl SalableQuantityCalculator {
    /// Combines the shared database with a configuration provider.
    pub fn new(db: Database, config: Arc<dyn StockItemConfigurationProvider>) -> Self {
        Self { db, config }
    }

    /// Indexed quantity plus the ledger sum of the pair.
    ///
    /// The ledger part reflects every acknowledged append; the indexed part
    /// may lag behind source changes still queued for reindex.
    pub fn get_salable_quantity(&self, sku: &str, stock_id: StockId) -> Result<Quantity, SalableQuantityError> {
        Ok(self.breakdown(sku, stock_id)?.salable())
    }

    /// Both components of the salable quantity.
    pub fn breakdown(&self, sku: &str, stock_id: StockId) -> Result<SalableBreakdown, SalableQuantityError> {
        self.config.get(sku, stock_id)?;
        Ok(self.db.read(|tx| read_breakdown(tx, sku, stock_id))?)
    }

    /// True when `requested` can be sold now.
    ///
    /// Unknown pairs and storage failures answer `false`.
    pub fn is_salable(&self, sku: &str, stock_id: StockId, requested: Quantity) -> bool {
        if !requested.is_positive() {
            return false;
        }
        let config = match self.config.get(sku, stock_id) {
            Ok(config) => config,
            Err(err) => {
                debug!(sku, stock_id, error = %err, "is_salable: no configuration");
                return false;
            }
        };
        let breakdown = match self.db.read(|tx| read_breakdown(tx, sku, stock_id)) {
            Ok(breakdown) => breakdown,
            Err(err) => {
                debug!(sku, stock_id, error = %err, "is_salable: read failed");
                return false;
            }
        };
        permits(breakdown.salable(), requested, config.backorders)
    }
}

/// Reads both components in a single statement so no append is torn.
pub(crate) fn read_breakdown(conn: &Connection, sku: &str, stock_id: StockId) -> PersistResult<SalableBreakdown> {
    let (indexed, reserved) = conn.query_row(
        "SELECT
             COALESCE((SELECT quantity FROM inventory_stock_index WHERE sku = ?1 AND stock_id = ?2), 0),
             COALESCE((SELECT SUM(quantity) FROM inventory_reservation WHERE sku = ?1 AND stock_id = ?2), 0)",
        params![sku, stock_id],
        |row| Ok((row.get::<_, Quantity>(0)?, row.get::<_, Quantity>(1)?)),
    )?;
    Ok(SalableBreakdown { indexed, reserved })
}

/// Sellability rule shared by reads and the conditional append.
pub(crate) fn permits(salable: Quantity, requested: Quantity, backorders: BackorderPolicy) -> bool {
    salable >= requested || backorders == BackorderPolicy::AllowQty
}
