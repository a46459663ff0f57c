//! "Only X left" signal for storefront display.

use std::sync::Arc;

use tracing::debug;

use crate::{
    config::{
        ConfigurationError, SalesChannel, StockItemConfiguration, StockItemConfigurationProvider,
        StockResolutionError, StockResolver,
    },
    types::Quantity,
};

use super::salable::{SalableQuantityCalculator, SalableQuantityError};

#[derive(Debug, thiserror::Error)]
enum LowStockError {
    #[error(transparent)]
    Stock(#[from] StockResolutionError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Salable(#[from] SalableQuantityError),
}

/// Derives the "only X left" display value.
#[derive(Clone)]
pub struct LowStockSignalResolver {
    stocks: Arc<dyn StockResolver>,
    config: Arc<dyn StockItemConfigurationProvider>,
    calculator: SalableQuantityCalculator,
}

impl LowStockSignalResolver {
    /// Combines the collaborators.
    pub fn new(
        stocks: Arc<dyn StockResolver>,
        config: Arc<dyn StockItemConfigurationProvider>,
        calculator: SalableQuantityCalculator,
    ) -> Self {
        Self {
            stocks,
            config,
            calculator,
        }
    }

    /// Quantity to show as "only X left" for `sku` on `channel`, if any.
    ///
    /// Never fails: every lookup error is logged and answered with `None`.
    pub fn get_only_x_left_qty(&self, sku: &str, channel: &SalesChannel) -> Option<Quantity> {
        match self.resolve(sku, channel) {
            Ok(qty) => qty,
            Err(err) => {
                debug!(sku, channel = %channel.code, error = %err, "low-stock signal suppressed");
                None
            }
        }
    }

    fn resolve(&self, sku: &str, channel: &SalesChannel) -> Result<Option<Quantity>, LowStockError> {
        let stock_id = self.stocks.stock_for(channel)?;
        let config = self.config.get(sku, stock_id)?;
        if config.stock_threshold_qty.is_zero() {
            return Ok(None);
        }
        let salable = self.calculator.get_salable_quantity(sku, stock_id)?;
        Ok(only_x_left(salable, &config))
    }
}

/// `salable - min_qty` when the signal fires for `config`, else `None`.
pub fn only_x_left(salable: Quantity, config: &StockItemConfiguration) -> Option<Quantity> {
    if config.stock_threshold_qty.is_zero() || !salable.is_positive() {
        return None;
    }
    let stock_left = salable - config.min_qty;
    (stock_left <= config.stock_threshold_qty).then_some(stock_left)
}
