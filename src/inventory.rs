//! Physical inventory topology: sources, stocks, links, and source items.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    persist::{Database, PersistResult},
    runtime::indexer::{IndexerError, SourceItemIndexer},
    types::{AggregationMode, Quantity, SourceCode, SourceItemId, SourceItemStatus, StockId},
};

/// A physical location holding quantity per sku.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Stable source code.
    pub source_code: SourceCode,
    /// Display name.
    pub name: String,
    /// Disabled sources never contribute to the index.
    pub enabled: bool,
}

/// A virtual stock aggregating linked sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    /// Stock id.
    pub stock_id: StockId,
    /// Display name.
    pub name: String,
    /// How linked source quantities are combined.
    pub aggregation: AggregationMode,
}

/// Assignment of a source to a stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLink {
    /// Target stock.
    pub stock_id: StockId,
    /// Linked source.
    pub source_code: SourceCode,
    /// Lower ordinals win under [`AggregationMode::Priority`].
    pub priority: u32,
}

/// Quantity of one sku at one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Holding source.
    pub source_code: SourceCode,
    /// Product sku.
    pub sku: String,
    /// Physical quantity.
    pub quantity: Quantity,
    /// Availability flag.
    pub status: SourceItemStatus,
}

/// Source item plus its row id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSourceItem {
    /// Row id published to the indexer topic.
    pub source_item_id: SourceItemId,
    /// Item body.
    pub item: SourceItem,
}

/// Reads and writes the topology tables.
#[derive(Debug, Clone)]
pub struct InventoryRepository {
    db: Database,
}

impl InventoryRepository {
    /// Wraps `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates or updates a source.
    pub fn save_source(&self, source: &Source) -> PersistResult<()> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO inventory_source(source_code, name, enabled) VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_code) DO UPDATE SET name = excluded.name, enabled = excluded.enabled",
                params![source.source_code, source.name, source.enabled],
            )?;
            Ok(())
        })
    }

    /// Creates or updates a stock.
    pub fn save_stock(&self, stock: &Stock) -> PersistResult<()> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO inventory_stock(stock_id, name, aggregation) VALUES (?1, ?2, ?3)
                 ON CONFLICT(stock_id) DO UPDATE SET name = excluded.name, aggregation = excluded.aggregation",
                params![stock.stock_id, stock.name, stock.aggregation],
            )?;
            Ok(())
        })
    }

    /// Links a source to a stock, replacing any previous priority.
    pub fn link_source(&self, link: &SourceLink) -> PersistResult<()> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO inventory_source_stock_link(stock_id, source_code, priority) VALUES (?1, ?2, ?3)
                 ON CONFLICT(stock_id, source_code) DO UPDATE SET priority = excluded.priority",
                params![link.stock_id, link.source_code, link.priority],
            )?;
            Ok(())
        })
    }

    /// Returns the stock with `stock_id`, if any.
    pub fn get_stock(&self, stock_id: StockId) -> PersistResult<Option<Stock>> {
        let conn = self.db.connection()?;
        let stock = conn
            .query_row(
                "SELECT stock_id, name, aggregation FROM inventory_stock WHERE stock_id = ?1",
                params![stock_id],
                |row| {
                    Ok(Stock {
                        stock_id: row.get(0)?,
                        name: row.get(1)?,
                        aggregation: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(stock)
    }

    /// Upserts items by (source, sku) and returns their row ids in input order.
    ///
    /// Does not touch the index; see [`SourceItemsSave`].
    pub fn save_source_items(&self, items: &[SourceItem]) -> PersistResult<Vec<SourceItemId>> {
        self.db.write(|tx| upsert_items(tx, items))
    }

    /// Loads one source item by id.
    pub fn get_source_item(&self, id: SourceItemId) -> PersistResult<Option<StoredSourceItem>> {
        let conn = self.db.connection()?;
        let item = conn
            .query_row(
                "SELECT source_item_id, source_code, sku, quantity, status
                 FROM inventory_source_item WHERE source_item_id = ?1",
                params![id as i64],
                |row| {
                    let source_item_id: i64 = row.get(0)?;
                    Ok(StoredSourceItem {
                        source_item_id: source_item_id as SourceItemId,
                        item: SourceItem {
                            source_code: row.get(1)?,
                            sku: row.get(2)?,
                            quantity: row.get(3)?,
                            status: row.get(4)?,
                        },
                    })
                },
            )
            .optional()?;
        Ok(item)
    }
}

fn upsert_items(conn: &Connection, items: &[SourceItem]) -> PersistResult<Vec<SourceItemId>> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO inventory_source_item(source_code, sku, quantity, status) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(source_code, sku) DO UPDATE SET quantity = excluded.quantity, status = excluded.status
         RETURNING source_item_id",
    )?;
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let id: i64 = stmt.query_row(
            params![item.source_code, item.sku, item.quantity, item.status],
            |row| row.get(0),
        )?;
        ids.push(id as SourceItemId);
    }
    Ok(ids)
}

/// Saves source items and schedules their reindex.
///
/// The items and their reindex step share one write transaction: in sync mode
/// the pairs are recomputed before commit, in async mode the id list is
/// published through [`crate::queue::MessageQueue::publish_in`]. A failed
/// publish rolls the items back and is returned to the caller, so the index
/// can never silently miss a committed change.
#[derive(Debug, Clone)]
pub struct SourceItemsSave {
    repository: InventoryRepository,
    indexer: SourceItemIndexer,
}

impl SourceItemsSave {
    /// Combines the repository and the indexer.
    pub fn new(repository: InventoryRepository, indexer: SourceItemIndexer) -> Self {
        Self {
            repository,
            indexer,
        }
    }

    /// Writes `items` and reindexes or publishes their ids, all or nothing.
    pub fn execute(&self, items: &[SourceItem]) -> Result<Vec<SourceItemId>, IndexerError> {
        let mut staged = None;
        let written = self.repository.db.write(|tx| {
            let ids = upsert_items(tx, items)?;
            staged = Some(self.indexer.stage(tx, &ids)?);
            Ok::<_, IndexerError>(ids)
        });

        match written {
            Ok(ids) => {
                debug!(count = ids.len(), "source items saved");
                if let Some(staged) = staged {
                    self.indexer.committed(staged);
                }
                Ok(ids)
            }
            Err(err) => {
                if let Some(staged) = staged {
                    self.indexer.abandon(staged);
                }
                Err(err)
            }
        }
    }
}
