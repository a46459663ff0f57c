//! Shared primitive IDs, the fixed-point quantity, and inventory enums.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Virtual stock identifier.
pub type StockId = u32;
/// Source item row identifier, carried on the indexer topic.
pub type SourceItemId = u64;
/// Reservation row identifier.
pub type ReservationId = u64;
/// Queue message identifier.
pub type MessageId = u64;
/// Stable code of a physical source.
pub type SourceCode = String;

/// Number of raw units per whole quantity unit (four decimal places).
pub const QUANTITY_SCALE: i64 = 10_000;

const MAX_ABS_RAW: i64 = 1_000_000_000_000_000_000;

/// Fixed-point quantity with four decimal places.
///
/// Stored as an integer count of ten-thousandths so that ledger sums are exact
/// and independent of the order in which deltas were appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub struct Quantity(i64);

/// Rejected conversion into [`Quantity`].
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("quantity {0} is not finite or out of range")]
pub struct InvalidQuantity(pub f64);

impl Quantity {
    /// Zero quantity.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw ten-thousandths count.
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Whole number of units.
    pub const fn whole(units: i64) -> Self {
        Self(units.saturating_mul(QUANTITY_SCALE))
    }

    /// Converts a decimal value, rounding to four places.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * QUANTITY_SCALE as f64).round();
        if scaled.abs() > MAX_ABS_RAW as f64 {
            return None;
        }
        Some(Self(scaled as i64))
    }

    /// Raw ten-thousandths count.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Decimal representation.
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / QUANTITY_SCALE as f64
    }

    /// True for strictly positive quantities.
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// True for strictly negative quantities.
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// True for zero.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for Quantity {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Quantity {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Quantity {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

impl From<Quantity> for f64 {
    fn from(value: Quantity) -> Self {
        value.as_f64()
    }
}

impl TryFrom<f64> for Quantity {
    type Error = InvalidQuantity;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::from_f64(value).ok_or(InvalidQuantity(value))
    }
}

impl ToSql for Quantity {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Quantity {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Self)
    }
}

/// How a stock combines the quantities of its linked sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationMode {
    /// Sum of all in-stock quantities across enabled sources.
    #[default]
    Sum,
    /// The enabled, in-stock source with the lowest priority ordinal wins.
    Priority,
}

/// Availability flag of a single source item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceItemStatus {
    /// Not counted by the index.
    OutOfStock,
    /// Counted by the index.
    #[default]
    InStock,
}

/// Whether a stock item may be sold past zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackorderPolicy {
    /// Never sell below zero.
    #[default]
    No,
    /// Sell below zero silently.
    AllowQty,
    /// Sell below zero, but the customer must be notified.
    AllowQtyAndNotify,
}

macro_rules! sql_enum {
    ($ty:ty { $($variant:ident = $code:literal),+ $(,)? }) => {
        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                let code: i64 = match self {
                    $(Self::$variant => $code,)+
                };
                Ok(rusqlite::types::ToSqlOutput::from(code))
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                match <i64 as rusqlite::types::FromSql>::column_result(value)? {
                    $($code => Ok(Self::$variant),)+
                    other => Err(rusqlite::types::FromSqlError::OutOfRange(other)),
                }
            }
        }
    };
}

pub(crate) use sql_enum;

sql_enum!(AggregationMode { Sum = 0, Priority = 1 });
sql_enum!(SourceItemStatus { OutOfStock = 0, InStock = 1 });
