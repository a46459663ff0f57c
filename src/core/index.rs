//! Per-(sku, stock) physical quantity derived from source items.
//!
//! Each row holds the aggregate of its linked source items plus
//! `settled_delta`, the net of settled reservations moved here by ledger
//! cleanup. Recomputing a pair from source items keeps `settled_delta`; only
//! [`SourceQuantityIndex::deduct`] consumes it, in the same transaction that
//! lowers the source item quantity.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    persist::{Database, PersistError, PersistResult},
    types::{AggregationMode, Quantity, SourceCode, SourceItemId, StockId},
};

/// Cached physical quantity of one (sku, stock) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedQuantity {
    /// Product sku.
    pub sku: String,
    /// Stock id.
    pub stock_id: StockId,
    /// Source aggregate plus `settled_delta`.
    pub quantity: Quantity,
    /// Settled reservation net not yet deducted from source items.
    pub settled_delta: Quantity,
    /// True when the aggregate is positive.
    pub is_salable: bool,
    /// Bumped on every change of the row.
    pub version: u64,
}

/// Aggregates source items into per-stock quantities.
///
/// Every recompute runs in a single write transaction, so two jobs touching
/// the same stock are serialized by the database and cannot lose an update.
#[derive(Debug, Clone)]
pub struct SourceQuantityIndex {
    db: Database,
}

impl SourceQuantityIndex {
    /// Wraps `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Reads the indexed row of a pair.
    pub fn get(&self, sku: &str, stock_id: StockId) -> PersistResult<Option<IndexedQuantity>> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                "SELECT sku, stock_id, quantity, settled_delta, is_salable, version
                 FROM inventory_stock_index WHERE sku = ?1 AND stock_id = ?2",
                params![sku, stock_id],
                |row| {
                    let version: i64 = row.get(5)?;
                    Ok(IndexedQuantity {
                        sku: row.get(0)?,
                        stock_id: row.get(1)?,
                        quantity: row.get(2)?,
                        settled_delta: row.get(3)?,
                        is_salable: row.get(4)?,
                        version: version as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Recomputes every pair of every stock. Returns the number of pairs.
    pub fn rebuild_all(&self) -> PersistResult<usize> {
        self.db.write(|tx| {
            let stocks: Vec<StockId> = {
                let mut stmt = tx.prepare(
                    "SELECT stock_id FROM inventory_stock
                     UNION SELECT stock_id FROM inventory_source_stock_link
                     UNION SELECT stock_id FROM inventory_stock_index",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };

            let mut pairs = BTreeSet::new();
            for stock_id in stocks {
                let mut stmt = tx.prepare(
                    "SELECT si.sku FROM inventory_source_item si
                     JOIN inventory_source_stock_link l ON l.source_code = si.source_code
                     WHERE l.stock_id = ?1
                     UNION SELECT sku FROM inventory_stock_index WHERE stock_id = ?1",
                )?;
                let skus = stmt.query_map(params![stock_id], |row| row.get::<_, String>(0))?;
                for sku in skus {
                    pairs.insert((sku?, stock_id));
                }
            }

            recompute_pairs(tx, &pairs)?;
            Ok(pairs.len())
        })
    }

    /// Recomputes only the pairs touched by `ids`. Returns the affected stocks.
    ///
    /// Running this any number of times for the same ids converges to the
    /// same rows; unchanged rows keep their version.
    pub fn reindex_source_items(&self, ids: &[SourceItemId]) -> PersistResult<Vec<StockId>> {
        self.db.write(|tx| reindex_in(tx, ids))
    }

    /// Stocks whose pairs `ids` feed, resolved through source links.
    pub fn affected_stocks(&self, ids: &[SourceItemId]) -> PersistResult<Vec<StockId>> {
        let conn = self.db.connection()?;
        stocks_in(&conn, ids)
    }

    /// Ships settled quantity out of source items.
    ///
    /// Lowers each source item by its deduction, consumes the same amount of
    /// the pair's `settled_delta`, and recomputes every pair the items feed,
    /// all in one write transaction. The salable quantity is unchanged by a
    /// deduction that matches earlier settlements. Returns the affected stocks.
    pub fn deduct(&self, deductions: &[SourceDeduction]) -> PersistResult<Vec<StockId>> {
        if deductions.is_empty() {
            return Ok(Vec::new());
        }
        let stocks = self.db.write(|tx| {
            let mut lower = tx.prepare_cached(
                "UPDATE inventory_source_item SET quantity = quantity - ?1
                 WHERE source_code = ?2 AND sku = ?3
                 RETURNING source_item_id",
            )?;
            let mut credit = tx.prepare_cached(
                "UPDATE inventory_stock_index SET
                     settled_delta = MIN(settled_delta + ?1, 0)
                 WHERE sku = ?2 AND stock_id = ?3 AND settled_delta < 0",
            )?;

            let mut ids = Vec::with_capacity(deductions.len());
            for deduction in deductions {
                if !deduction.quantity.is_positive() {
                    return Err(PersistError::Message(format!(
                        "deduction of {} for {} must be positive",
                        deduction.quantity, deduction.sku
                    )));
                }
                let id: Option<i64> = lower
                    .query_row(
                        params![deduction.quantity, deduction.source_code, deduction.sku],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(id) = id else {
                    return Err(PersistError::Message(format!(
                        "no source item {} at {}",
                        deduction.sku, deduction.source_code
                    )));
                };
                credit.execute(params![deduction.quantity, deduction.sku, deduction.stock_id])?;
                ids.push(id as SourceItemId);
            }

            let mut pairs = affected_pairs(tx, &ids)?;
            pairs.extend(deductions.iter().map(|d| (d.sku.clone(), d.stock_id)));
            recompute_pairs(tx, &pairs)?;
            let stocks: BTreeSet<StockId> = pairs.iter().map(|(_, stock_id)| *stock_id).collect();
            Ok(stocks.into_iter().collect::<Vec<_>>())
        })?;
        debug!(count = deductions.len(), stocks = ?stocks, "source deductions applied");
        Ok(stocks)
    }
}

/// Quantity shipped from a source on behalf of a stock's settled orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDeduction {
    /// Stock whose settled reservations the shipment fulfils.
    pub stock_id: StockId,
    /// Shipping source.
    pub source_code: SourceCode,
    /// Product sku.
    pub sku: String,
    /// Positive quantity leaving the source.
    pub quantity: Quantity,
}

/// Adds `delta` to the settled part of a pair, creating the row if needed.
pub(crate) fn fold_into(conn: &Connection, sku: &str, stock_id: StockId, delta: Quantity) -> PersistResult<()> {
    conn.execute(
        "INSERT INTO inventory_stock_index(sku, stock_id, quantity, settled_delta, is_salable, version)
         VALUES (?1, ?2, ?3, ?3, ?3 > 0, 1)
         ON CONFLICT(sku, stock_id) DO UPDATE SET
             quantity = quantity + excluded.quantity,
             settled_delta = settled_delta + excluded.settled_delta,
             is_salable = (quantity + excluded.quantity) > 0,
             version = version + 1",
        params![sku, stock_id, delta],
    )?;
    Ok(())
}

/// Recomputes the pairs fed by `ids` on an open transaction.
pub(crate) fn reindex_in(conn: &Connection, ids: &[SourceItemId]) -> PersistResult<Vec<StockId>> {
    let pairs = affected_pairs(conn, ids)?;
    recompute_pairs(conn, &pairs)?;
    let stocks: BTreeSet<StockId> = pairs.iter().map(|(_, stock_id)| *stock_id).collect();
    Ok(stocks.into_iter().collect())
}

/// Stocks fed by `ids`, read on an open connection.
pub(crate) fn stocks_in(conn: &Connection, ids: &[SourceItemId]) -> PersistResult<Vec<StockId>> {
    let stocks: BTreeSet<StockId> = affected_pairs(conn, ids)?
        .into_iter()
        .map(|(_, stock_id)| stock_id)
        .collect();
    Ok(stocks.into_iter().collect())
}

fn affected_pairs(conn: &Connection, ids: &[SourceItemId]) -> PersistResult<BTreeSet<(String, StockId)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT si.sku, l.stock_id FROM inventory_source_item si
         JOIN inventory_source_stock_link l ON l.source_code = si.source_code
         WHERE si.source_item_id = ?1",
    )?;
    let mut pairs = BTreeSet::new();
    for id in ids {
        let rows = stmt.query_map(params![*id as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, StockId>(1)?))
        })?;
        for pair in rows {
            pairs.insert(pair?);
        }
    }
    Ok(pairs)
}

fn recompute_pairs(conn: &Connection, pairs: &BTreeSet<(String, StockId)>) -> PersistResult<()> {
    let mut mode_stmt =
        conn.prepare_cached("SELECT aggregation FROM inventory_stock WHERE stock_id = ?1")?;
    let mut contrib_stmt = conn.prepare_cached(
        "SELECT si.quantity FROM inventory_source_item si
         JOIN inventory_source_stock_link l ON l.source_code = si.source_code
         JOIN inventory_source s ON s.source_code = si.source_code
         WHERE l.stock_id = ?1 AND si.sku = ?2 AND s.enabled = 1 AND si.status = 1
         ORDER BY l.priority ASC, si.source_code ASC",
    )?;
    // `excluded.quantity` is the bare source aggregate; the settled part survives.
    let mut upsert_stmt = conn.prepare_cached(
        "INSERT INTO inventory_stock_index(sku, stock_id, quantity, settled_delta, is_salable, version)
         VALUES (?1, ?2, ?3, 0, ?4, 1)
         ON CONFLICT(sku, stock_id) DO UPDATE SET
             quantity = excluded.quantity + settled_delta,
             is_salable = (excluded.quantity + settled_delta) > 0,
             version = version + 1
         WHERE quantity != excluded.quantity + settled_delta
            OR is_salable != ((excluded.quantity + settled_delta) > 0)",
    )?;

    for (sku, stock_id) in pairs {
        let mode: AggregationMode = mode_stmt
            .query_row(params![stock_id], |row| row.get(0))
            .optional()?
            .unwrap_or_default();
        let contributions = contrib_stmt
            .query_map(params![stock_id, sku], |row| row.get::<_, Quantity>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let quantity = aggregate(mode, &contributions);
        upsert_stmt.execute(params![sku, stock_id, quantity, quantity.is_positive()])?;
    }
    Ok(())
}

/// Combines in-stock quantities ordered by source priority.
fn aggregate(mode: AggregationMode, ordered: &[Quantity]) -> Quantity {
    match mode {
        AggregationMode::Sum => ordered.iter().copied().sum(),
        AggregationMode::Priority => ordered
            .iter()
            .copied()
            .find(|qty| qty.is_positive())
            .unwrap_or(Quantity::ZERO),
    }
}
