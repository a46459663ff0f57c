//! Append-only reservation ledger.
//!
//! Reservations are signed deltas keyed by (sku, stock). Settled objects are
//! periodically folded into the index by [`ReservationLedger::cleanup`].

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::{ConfigurationError, StockItemConfiguration, StockItemConfigurationProvider},
    persist::{Database, PersistError, PersistResult, now_ms},
    reservation::{Reservation, ReservationObject, StoredReservation, ValidationError},
    types::{Quantity, ReservationId, StockId},
};

use super::{
    index::fold_into,
    salable::{permits, read_breakdown},
};

/// Write-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    /// Nothing was appended.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A conditional append would oversell the pair.
    #[error("insufficient quantity for {sku} on stock {stock_id}: salable {salable}, requested {requested}")]
    InsufficientQuantity {
        /// Debited sku.
        sku: String,
        /// Debited stock.
        stock_id: StockId,
        /// Salable quantity seen inside the write transaction.
        salable: Quantity,
        /// Net quantity the batch tried to take.
        requested: Quantity,
    },
    /// Configuration could not be loaded.
    #[error("configuration unavailable: {0}")]
    Configuration(ConfigurationError),
    /// Storage failure.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Outcome of one [`ReservationLedger::cleanup`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Pairs whose settled net delta moved into the index.
    pub folded_pairs: usize,
    /// Ledger rows removed.
    pub removed_rows: usize,
    /// Settlement markers dropped after the retention window.
    pub pruned_settlements: usize,
}

/// Ledger housekeeping settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long a settlement marker outlives its last ledger row.
    ///
    /// Rows appended for a settled object within this window are still folded
    /// by cleanup; later ones stay in the ledger like any unsettled row.
    pub settlement_retention_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            settlement_retention_ms: 7 * 24 * 60 * 60 * 1_000,
        }
    }
}

/// Append-only log of signed quantity deltas.
///
/// Rows are only ever inserted; sums are computed by aggregation at read
/// time, so concurrent appenders never race on a shared counter.
#[derive(Clone)]
pub struct ReservationLedger {
    db: Database,
    config: Arc<dyn StockItemConfigurationProvider>,
    settings: LedgerConfig,
}

impl ReservationLedger {
    /// Combines the shared database with a configuration provider.
    pub fn new(db: Database, config: Arc<dyn StockItemConfigurationProvider>) -> Self {
        Self::with_config(db, config, LedgerConfig::default())
    }

    /// Like [`ReservationLedger::new`] with explicit housekeeping settings.
    pub fn with_config(
        db: Database,
        config: Arc<dyn StockItemConfigurationProvider>,
        settings: LedgerConfig,
    ) -> Self {
        Self { db, config, settings }
    }

    /// Inserts every reservation as its own row, all or nothing.
    ///
    /// Fails with [`ValidationError::SkuNotAssignedToStock`] when any pair is
    /// unconfigured.
    pub fn append(&self, reservations: &[Reservation]) -> Result<(), ReservationError> {
        for reservation in reservations {
            self.validate(reservation)?;
        }
        if reservations.is_empty() {
            return Ok(());
        }

        self.db.write(|tx| insert_rows(tx, reservations))?;
        debug!(count = reservations.len(), "reservations appended");
        Ok(())
    }

    /// Appends the batch only if no debited pair would be oversold.
    ///
    /// Availability is re-derived inside the write transaction, so a check made
    /// earlier on stale data can never let the batch through.
    pub fn reserve(&self, reservations: &[Reservation]) -> Result<(), ReservationError> {
        let mut nets: BTreeMap<(String, StockId), (Quantity, StockItemConfiguration)> = BTreeMap::new();
        for reservation in reservations {
            let config = self.validate(reservation)?;
            nets.entry((reservation.sku.clone(), reservation.stock_id))
                .or_insert((Quantity::ZERO, config))
                .0 += reservation.quantity;
        }
        if reservations.is_empty() {
            return Ok(());
        }

        self.db.write(|tx| {
            for ((sku, stock_id), (net, config)) in &nets {
                if !net.is_negative() {
                    continue;
                }
                let salable = read_breakdown(tx, sku, *stock_id)?.salable();
                let requested = -*net;
                if !permits(salable, requested, config.backorders) {
                    return Err(ReservationError::InsufficientQuantity {
                        sku: sku.clone(),
                        stock_id: *stock_id,
                        salable,
                        requested,
                    });
                }
            }
            insert_rows(tx, reservations)
        })?;
        debug!(count = reservations.len(), "reservations reserved");
        Ok(())
    }

    /// Sum of all current rows of a pair; zero when there are none.
    pub fn reservations_sum(&self, sku: &str, stock_id: StockId) -> PersistResult<Quantity> {
        let conn = self.db.connection()?;
        let sum = conn.query_row(
            "SELECT COALESCE(SUM(quantity), 0) FROM inventory_reservation WHERE sku = ?1 AND stock_id = ?2",
            params![sku, stock_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    /// Current rows recorded for `object`, oldest first.
    pub fn reservations_for(&self, object: &ReservationObject) -> PersistResult<Vec<StoredReservation>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT reservation_id, sku, stock_id, quantity FROM inventory_reservation
             WHERE object_type = ?1 AND object_id = ?2 ORDER BY reservation_id ASC",
        )?;
        let rows = stmt.query_map(params![object.object_type, object.object_id], |row| {
            let id: i64 = row.get(0)?;
            Ok(StoredReservation {
                reservation_id: id as ReservationId,
                reservation: Reservation {
                    sku: row.get(1)?,
                    stock_id: row.get(2)?,
                    quantity: row.get(3)?,
                    object: object.clone(),
                },
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Appends compensating rows that cancel the net delta of `object`.
    ///
    /// Returns the number of rows appended; a second call appends nothing.
    pub fn release(&self, object: &ReservationObject) -> PersistResult<usize> {
        let appended = self.db.write(|tx| {
            let nets = object_nets(tx, object)?;
            let compensations: Vec<Reservation> = nets
                .into_iter()
                .filter(|(_, net)| !net.is_zero())
                .map(|((sku, stock_id), net)| Reservation {
                    sku,
                    stock_id,
                    quantity: -net,
                    object: object.clone(),
                })
                .collect();
            insert_rows(tx, &compensations).map_err(|err| match err {
                ReservationError::Persist(err) => err,
                other => PersistError::Message(other.to_string()),
            })?;
            Ok::<_, PersistError>(compensations.len())
        })?;
        debug!(object_id = %object.object_id, appended, "reservations released");
        Ok(appended)
    }

    /// Marks `object` as settled so the next cleanup folds its rows.
    pub fn settle(&self, object: &ReservationObject) -> PersistResult<()> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO inventory_reservation_settlement(object_type, object_id, settled_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![object.object_type, object.object_id, now_ms()],
            )?;
            Ok(())
        })
    }

    /// Folds settled rows into the index and drops fully compensated groups.
    ///
    /// Runs as one write transaction: a reader sees either the rows in the
    /// ledger or their net delta in the index, never both or neither. Calling
    /// it again without new settlements changes nothing. Settlement markers
    /// older than the retention window with no rows left are pruned.
    pub fn cleanup(&self) -> PersistResult<CleanupReport> {
        let retention = i64::try_from(self.settings.settlement_retention_ms).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(retention);
        let report = self.db.write(|tx| {
            let settled: Vec<(String, StockId, Quantity)> = {
                let mut stmt = tx.prepare(
                    "SELECT r.sku, r.stock_id, SUM(r.quantity) FROM inventory_reservation r
                     JOIN inventory_reservation_settlement s
                       ON s.object_type = r.object_type AND s.object_id = r.object_id
                     GROUP BY r.sku, r.stock_id",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
                rows.collect::<Result<_, _>>()?
            };

            let mut report = CleanupReport::default();
            for (sku, stock_id, net) in &settled {
                if !net.is_zero() {
                    fold_into(tx, sku, *stock_id, *net)?;
                    report.folded_pairs += 1;
                }
            }

            report.removed_rows += tx.execute(
                "DELETE FROM inventory_reservation WHERE EXISTS (
                     SELECT 1 FROM inventory_reservation_settlement s
                     WHERE s.object_type = inventory_reservation.object_type
                       AND s.object_id = inventory_reservation.object_id)",
                [],
            )?;

            report.removed_rows += tx.execute(
                "DELETE FROM inventory_reservation WHERE (object_type, object_id, sku, stock_id) IN (
                     SELECT object_type, object_id, sku, stock_id FROM inventory_reservation
                     GROUP BY object_type, object_id, sku, stock_id
                     HAVING SUM(quantity) = 0)",
                [],
            )?;

            report.pruned_settlements = tx.execute(
                "DELETE FROM inventory_reservation_settlement
                 WHERE settled_at_ms <= ?1 AND NOT EXISTS (
                     SELECT 1 FROM inventory_reservation r
                     WHERE r.object_type = inventory_reservation_settlement.object_type
                       AND r.object_id = inventory_reservation_settlement.object_id)",
                params![cutoff],
            )?;

            Ok::<_, PersistError>(report)
        })?;

        if report.removed_rows > 0 || report.pruned_settlements > 0 {
            info!(
                folded_pairs = report.folded_pairs,
                removed_rows = report.removed_rows,
                pruned_settlements = report.pruned_settlements,
                "reservation cleanup"
            );
        }
        Ok(report)
    }

    fn validate(&self, reservation: &Reservation) -> Result<StockItemConfiguration, ReservationError> {
        reservation.validate_shape()?;
        self.config
            .get(&reservation.sku, reservation.stock_id)
            .map_err(|err| match err {
                ConfigurationError::StockNotFound(_) | ConfigurationError::SkuNotAssignedToStock { .. } => {
                    ReservationError::Validation(ValidationError::SkuNotAssignedToStock {
                        sku: reservation.sku.clone(),
                        stock_id: reservation.stock_id,
                    })
                }
                other => ReservationError::Configuration(other),
            })
    }
}

fn insert_rows(conn: &Connection, reservations: &[Reservation]) -> Result<(), ReservationError> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO inventory_reservation(stock_id, sku, quantity, object_type, object_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(PersistError::from)?;
    for reservation in reservations {
        stmt.execute(params![
            reservation.stock_id,
            reservation.sku,
            reservation.quantity,
            reservation.object.object_type,
            reservation.object.object_id,
        ])
        .map_err(PersistError::from)?;
    }
    Ok(())
}

fn object_nets(
    conn: &Connection,
    object: &ReservationObject,
) -> PersistResult<BTreeMap<(String, StockId), Quantity>> {
    let mut stmt = conn.prepare(
        "SELECT sku, stock_id, SUM(quantity) FROM inventory_reservation
         WHERE object_type = ?1 AND object_id = ?2 GROUP BY sku, stock_id",
    )?;
    let rows = stmt.query_map(params![object.object_type, object.object_id], |row| {
        Ok(((row.get::<_, String>(0)?, row.get::<_, StockId>(1)?), row.get::<_, Quantity>(2)?))
    })?;
    let mut nets = BTreeMap::new();
    for row in rows {
        let (pair, net) = row?;
        nets.insert(pair, net);
    }
    Ok(nets)
}
