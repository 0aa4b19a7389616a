use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::product::Product;

/// Prices and money amounts are exact decimals.
pub type Price = Decimal;

/// Represents which side of the market the order is on.
///
/// # Intuition
/// - `Buy` (Bid): the team wants to acquire the product. Resting buys are ranked from
///   **highest to lowest price**, a higher price being more willing to trade.
/// - `Sell` (Ask): the team wants to give up the product. Resting sells are ranked from
///   **lowest to highest price**.
///
/// An incoming buy therefore meets the cheapest sell first, and an incoming sell meets the
/// richest buy first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,  // Bid
    Sell, // Ask
}

/// Specifies whether an order is a Limit or Market order.
///
/// - `Limit`: trades at its limit price or better
/// - `Market`: trades against anything; the price comes from the counterparty or the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderMode {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }
}

/// An order submitted by a team.
///
/// - `limit_price` is `Some` exactly when `mode` is `Limit`
/// - `seq` is the arrival sequence assigned by the exchange; it breaks time-priority ties
///   between orders created within the same clock tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: String,
    pub team: String,
    pub side: Side,
    pub mode: OrderMode,
    pub product: Product,
    pub quantity: u64,
    pub filled_qty: u64,
    pub limit_price: Option<Price>,
    #[serde(default)]
    pub message: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seq: u64,
    pub status: OrderStatus,
}

impl Order {
    pub fn remaining(&self) -> u64 {
        self.quantity - self.filled_qty
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| now > t)
    }

    /// Records `qty` more units as executed and moves the status forward.
    ///
    /// Callers never fill past `quantity`; the matcher sizes trades as the minimum of both
    /// remainders.
    pub fn apply_fill(&mut self, qty: u64) {
        debug_assert!(qty <= self.remaining());
        self.filled_qty += qty;
        self.status = if self.filled_qty == self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }
}
