//! Reservation records, the checkout object they belong to, and the builder.

use serde::{Deserialize, Serialize};

use crate::types::{Quantity, ReservationId, StockId, sql_enum};

/// Kind of business object a reservation was recorded for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// A placed order.
    Order,
    /// A quote (cart) holding quantity before order placement.
    Quote,
    /// An administrative adjustment.
    #[default]
    Manual,
}

sql_enum!(ObjectType { Order = 0, Quote = 1, Manual = 2 });

/// The checkout object a reservation belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationObject {
    /// Object kind.
    pub object_type: ObjectType,
    /// Object identifier, opaque to the ledger.
    pub object_id: String,
}

impl ReservationObject {
    /// Reservation owner for an order.
    pub fn order(object_id: impl Into<String>) -> Self {
        Self {
            object_type: ObjectType::Order,
            object_id: object_id.into(),
        }
    }

    /// Reservation owner for a quote.
    pub fn quote(object_id: impl Into<String>) -> Self {
        Self {
            object_type: ObjectType::Quote,
            object_id: object_id.into(),
        }
    }
}

/// Immutable signed quantity delta against a (sku, stock) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Product sku.
    pub sku: String,
    /// Stock the hold is recorded against.
    pub stock_id: StockId,
    /// Signed delta; negative holds quantity, positive releases it.
    pub quantity: Quantity,
    /// Owning checkout object.
    pub object: ReservationObject,
}

/// Ledger row metadata plus the reservation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReservation {
    /// Monotonic row id assigned on insert.
    pub reservation_id: ReservationId,
    /// Reservation body.
    pub reservation: Reservation,
}

/// Reservation rejected before anything was appended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The sku is empty.
    #[error("reservation sku is empty")]
    EmptySku,
    /// No stock was given.
    #[error("reservation for {sku} has no stock")]
    MissingStock {
        /// Offending sku.
        sku: String,
    },
    /// The delta is missing, zero, or not representable.
    #[error("reservation for {sku} has an invalid quantity")]
    InvalidQuantity {
        /// Offending sku.
        sku: String,
    },
    /// The pair has no stock item configuration.
    #[error("sku {sku} is not assigned to stock {stock_id}")]
    SkuNotAssignedToStock {
        /// Offending sku.
        sku: String,
        /// Target stock.
        stock_id: StockId,
    },
}

/// Step-wise constructor that validates the shape of a [`Reservation`].
#[derive(Debug, Clone, Default)]
pub struct ReservationBuilder {
    sku: Option<String>,
    stock_id: Option<StockId>,
    quantity: Option<f64>,
    object: ReservationObject,
}

impl ReservationBuilder {
    /// Starts an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sku.
    pub fn sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    /// Sets the stock.
    pub fn stock_id(mut self, stock_id: StockId) -> Self {
        self.stock_id = Some(stock_id);
        self
    }

    /// Sets the signed decimal delta.
    pub fn quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Sets the owning object. Defaults to an anonymous manual adjustment.
    pub fn object(mut self, object: ReservationObject) -> Self {
        self.object = object;
        self
    }

    /// Validates and produces the reservation.
    pub fn build(self) -> Result<Reservation, ValidationError> {
        let sku = self
            .sku
            .filter(|sku| !sku.trim().is_empty())
            .ok_or(ValidationError::EmptySku)?;
        let stock_id = self
            .stock_id
            .ok_or_else(|| ValidationError::MissingStock { sku: sku.clone() })?;
        let quantity = self
            .quantity
            .and_then(Quantity::from_f64)
            .filter(|qty| !qty.is_zero())
            .ok_or_else(|| ValidationError::InvalidQuantity { sku: sku.clone() })?;

        Ok(Reservation {
            sku,
            stock_id,
            quantity,
            object: self.object,
        })
    }
}

impl Reservation {
    /// Checks the shape of a reservation built without the builder.
    pub fn validate_shape(&self) -> Result<(), ValidationError> {
        if self.sku.trim().is_empty() {
            return Err(ValidationError::EmptySku);
        }
        if self.quantity.is_zero() {
            return Err(ValidationError::InvalidQuantity {
                sku: self.sku.clone(),
            });
        }
        Ok(())
    }
}
