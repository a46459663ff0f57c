//! Stock item configuration and sales-channel resolution collaborators.

use std::sync::RwLock;

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::types::{BackorderPolicy, Quantity, StockId};

/// Per (sku, stock) inventory settings consumed by the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockItemConfiguration {
    /// Quantity kept back from display calculations.
    pub min_qty: Quantity,
    /// Low-stock trigger; zero disables the signal.
    pub stock_threshold_qty: Quantity,
    /// Backorder policy for the pair.
    pub backorders: BackorderPolicy,
    /// Quantity below which admins are notified.
    pub notify_stock_qty: Quantity,
}

/// Configuration lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// The stock is unknown.
    #[error("stock {0} not found")]
    StockNotFound(StockId),
    /// The sku has no configuration on a known stock.
    #[error("sku {sku} is not assigned to stock {stock_id}")]
    SkuNotAssignedToStock {
        /// Requested sku.
        sku: String,
        /// Requested stock.
        stock_id: StockId,
    },
    /// The backing store could not be read.
    #[error("configuration store unavailable")]
    Unavailable,
}

/// Resolves [`StockItemConfiguration`] per (sku, stock).
pub trait StockItemConfigurationProvider: Send + Sync {
    /// Loads the configuration of `sku` on `stock_id`.
    fn get(&self, sku: &str, stock_id: StockId) -> Result<StockItemConfiguration, ConfigurationError>;
}

/// In-process configuration table.
#[derive(Debug, Default)]
pub struct InMemoryConfigurationProvider {
    stocks: RwLock<HashSet<StockId>>,
    items: RwLock<HashMap<(String, StockId), StockItemConfiguration>>,
}

impl InMemoryConfigurationProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stock without assigning any sku to it.
    pub fn register_stock(&self, stock_id: StockId) {
        if let Ok(mut stocks) = self.stocks.write() {
            stocks.insert(stock_id);
        }
    }

    /// Assigns `sku` to `stock_id` with the given settings.
    pub fn assign(&self, sku: impl Into<String>, stock_id: StockId, config: StockItemConfiguration) {
        self.register_stock(stock_id);
        if let Ok(mut items) = self.items.write() {
            items.insert((sku.into(), stock_id), config);
        }
    }

    /// Removes the assignment of `sku` to `stock_id`.
    pub fn unassign(&self, sku: &str, stock_id: StockId) {
        if let Ok(mut items) = self.items.write() {
            items.remove(&(sku.to_string(), stock_id));
        }
    }
}

impl StockItemConfigurationProvider for InMemoryConfigurationProvider {
    fn get(&self, sku: &str, stock_id: StockId) -> Result<StockItemConfiguration, ConfigurationError> {
        let known = self
            .stocks
            .read()
            .map_err(|_| ConfigurationError::Unavailable)?
            .contains(&stock_id);
        if !known {
            return Err(ConfigurationError::StockNotFound(stock_id));
        }

        self.items
            .read()
            .map_err(|_| ConfigurationError::Unavailable)?
            .get(&(sku.to_string(), stock_id))
            .copied()
            .ok_or_else(|| ConfigurationError::SkuNotAssignedToStock {
                sku: sku.to_string(),
                stock_id,
            })
    }
}

/// A website-like sales channel, identified by its code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SalesChannel {
    /// Channel code.
    pub code: String,
}

impl SalesChannel {
    /// Website channel with the given code.
    pub fn website(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// The channel has no stock mapped to it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no stock assigned to sales channel {0}")]
pub struct StockResolutionError(pub String);

/// Maps the caller's sales channel to exactly one stock.
pub trait StockResolver: Send + Sync {
    /// Resolves the stock serving `channel`.
    fn stock_for(&self, channel: &SalesChannel) -> Result<StockId, StockResolutionError>;
}

/// Fixed channel-to-stock table.
#[derive(Debug, Default, Clone)]
pub struct StaticStockResolver {
    channels: HashMap<String, StockId>,
}

impl StaticStockResolver {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `channel` to `stock_id`.
    pub fn with_channel(mut self, channel: SalesChannel, stock_id: StockId) -> Self {
        self.channels.insert(channel.code, stock_id);
        self
    }
}

impl StockResolver for StaticStockResolver {
    fn stock_for(&self, channel: &SalesChannel) -> Result<StockId, StockResolutionError> {
        self.channels
            .get(&channel.code)
            .copied()
            .ok_or_else(|| StockResolutionError(channel.code.clone()))
    }
}
