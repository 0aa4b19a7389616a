use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{orders::Price, product::Product};

/// A fill is one executed trade between a buy order and a sell order.
///
/// # Terminology
/// - **Maker**: the order that was already resting in the book.
/// - **Taker**: the incoming order that triggered the trade.
///
/// Either side can be the maker. The price is the maker's limit when it has one, see
/// [`crate::matching::trade_price`]. Fills are append-only: settlement creates each one
/// exactly once and nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    #[serde(rename = "fillID")]
    pub fill_id: String,
    pub buyer: String,
    pub seller: String,
    #[serde(rename = "buyerClOrdID")]
    pub buyer_cl_ord_id: String,
    #[serde(rename = "sellerClOrdID")]
    pub seller_cl_ord_id: String,
    pub product: Product,
    pub price: Price,
    pub quantity: u64,
    #[serde(default)]
    pub buyer_message: String,
    #[serde(default)]
    pub seller_message: String,
    pub executed_at: DateTime<Utc>,
}

impl Fill {
    /// `FILL-<unix seconds>-<8 hex chars>`
    pub fn next_id(now: DateTime<Utc>) -> String {
        format!("FILL-{}-{}", now.timestamp(), short_uuid())
    }

    pub fn notional(&self) -> Price {
        self.price * Price::from(self.quantity)
    }

    pub fn involves(&self, team: &str) -> bool {
        self.buyer == team || self.seller == team
    }
}

pub(crate) fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
