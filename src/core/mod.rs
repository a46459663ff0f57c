//! Reservation ledger, physical index, and the quantities derived from both.

/// Source-quantity index over source items.
pub mod index;
/// Append-only reservation ledger and its cleanup.
pub mod ledger;
/// Low-stock display signal.
pub mod low_stock;
/// Salable quantity calculation.
pub mod salable;
