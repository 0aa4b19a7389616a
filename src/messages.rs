use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    errors::ErrorCode,
    fill::Fill,
    ledger::MarketState,
    market_data::Ticker,
    offers::Offer,
    orders::{Order, OrderMode, OrderStatus, Price, Side},
    product::Product,
    production::{Recipe, Role},
};

// ---- client → server ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Login(LoginRequest),
    Order(OrderRequest),
    ProductionUpdate(ProductionRequest),
    AcceptOffer(AcceptOfferRequest),
    Resync(ResyncRequest),
    Cancel(CancelRequest),
    Ping,
    RequestAllOrders,
    RequestPerformanceReport(PerformanceRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

/// An ORDER as sent by the client. Fields are kept loose (signed quantity, raw product
/// and expiry strings) so validation can answer with the precise error code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[serde(rename = "clOrdID", default)]
    pub cl_ord_id: String,
    pub side: Side,
    pub mode: OrderMode,
    #[serde(default)]
    pub product: String,
    pub qty: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRequest {
    pub product: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptOfferRequest {
    pub offer_id: String,
    pub accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_offered: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_offered: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

// ---- server → client ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    LoginOk(LoginOk),
    OrderAck(OrderAck),
    Fill(FillReport),
    Ticker(Ticker),
    Offer(OfferNotice),
    Error(ErrorReport),
    EventDelta(EventDelta),
    BalanceUpdate(BalanceUpdate),
    InventoryUpdate(InventoryUpdate),
    Pong(Pong),
    AllOrders(AllOrders),
    PerformanceReport(PerformanceReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOk {
    pub team: String,
    pub species: String,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub inventory: BTreeMap<String, u64>,
    pub authorized_products: Vec<Product>,
    pub recipes: BTreeMap<String, Recipe>,
    pub role: Role,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: String,
    pub status: OrderStatus,
    pub server_time: DateTime<Utc>,
}

/// One fill from the point of view of one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillReport {
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: String,
    pub fill_qty: u64,
    pub fill_price: Price,
    pub side: Side,
    pub product: Product,
    pub counterparty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_qty: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_qty: Option<u64>,
    pub server_time: DateTime<Utc>,
}

impl FillReport {
    /// Report for `side`, stamped with the fill's execution time. Order progress is unknown
    /// here, so `remainingQty`/`totalQty` are left out; see [`FillReport::with_progress`].
    pub fn from_fill(fill: &Fill, side: Side) -> Self {
        let (cl_ord_id, counterparty, message) = match side {
            Side::Buy => (&fill.buyer_cl_ord_id, &fill.seller, &fill.seller_message),
            Side::Sell => (&fill.seller_cl_ord_id, &fill.buyer, &fill.buyer_message),
        };
        Self {
            cl_ord_id: cl_ord_id.clone(),
            fill_qty: fill.quantity,
            fill_price: fill.price,
            side,
            product: fill.product.clone(),
            counterparty: counterparty.clone(),
            counterparty_message: (!message.is_empty()).then(|| message.clone()),
            remaining_qty: None,
            total_qty: None,
            server_time: fill.executed_at,
        }
    }

    pub fn with_progress(mut self, order: &Order) -> Self {
        self.remaining_qty = Some(order.remaining());
        self.total_qty = Some(order.quantity);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferNotice {
    #[serde(rename = "offerId")]
    pub offer_id: String,
    pub buyer: String,
    pub product: Product,
    pub quantity_requested: u64,
    pub max_price: Price,
    /// Milliseconds until the offer lapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl From<&Offer> for OfferNotice {
    fn from(offer: &Offer) -> Self {
        Self {
            offer_id: offer.offer_id.clone(),
            buyer: offer.buyer.clone(),
            product: offer.product.clone(),
            quantity_requested: offer.quantity_requested,
            max_price: offer.max_price,
            expires_in: offer
                .expires_at
                .map(|at| (at - offer.created_at).num_milliseconds().max(0) as u64),
            timestamp: offer.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub reason: String,
    #[serde(rename = "clOrdID", default, skip_serializing_if = "Option::is_none")]
    pub cl_ord_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDelta {
    pub events: Vec<FillReport>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdate {
    pub balance: Decimal,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryUpdate {
    pub inventory: BTreeMap<String, u64>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: DateTime<Utc>,
}

/// A team's view of one of its live orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    #[serde(rename = "clOrdID")]
    pub cl_ord_id: String,
    pub side: Side,
    pub mode: OrderMode,
    pub product: Product,
    pub quantity: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    pub filled_qty: u64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl From<Order> for OrderSummary {
    fn from(order: Order) -> Self {
        Self {
            cl_ord_id: order.cl_ord_id,
            side: order.side,
            mode: order.mode,
            product: order.product,
            quantity: order.quantity,
            price: order.limit_price,
            filled_qty: order.filled_qty,
            status: order.status,
            message: order.message,
            created_at: order.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllOrders {
    pub orders: Vec<OrderSummary>,
    pub server_time: DateTime<Utc>,
}

/// Trading results of one team over a window of fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub team_name: String,
    pub start_balance: Decimal,
    pub final_balance: Decimal,
    pub profit_loss: Decimal,
    /// Cash return on the starting balance, in percent.
    pub roi: Decimal,
    /// Return in percent with inventory valued at known mids.
    pub pnl_percent: Decimal,
    pub total_trades: usize,
    pub total_volume: Decimal,
    pub avg_trade_size: Decimal,
    pub buy_trades: usize,
    pub sell_trades: usize,
    pub products: BTreeMap<String, usize>,
    pub final_inventory: BTreeMap<String, u64>,
    pub server_time: DateTime<Utc>,
}

impl PerformanceReport {
    pub fn new(state: &MarketState, fills: &[Fill], now: DateTime<Utc>) -> Self {
        let mut products: BTreeMap<String, usize> = BTreeMap::new();
        let (mut buy_trades, mut sell_trades) = (0, 0);
        let mut total_volume = Decimal::ZERO;
        for fill in fills {
            total_volume += fill.notional();
            *products.entry(fill.product.to_string()).or_insert(0) += 1;
            if fill.buyer == state.team {
                buy_trades += 1;
            }
            if fill.seller == state.team {
                sell_trades += 1;
            }
        }
        let avg_trade_size = if fills.is_empty() {
            Decimal::ZERO
        } else {
            total_volume / Decimal::from(fills.len())
        };
        let profit_loss = state.balance - state.initial_balance;
        let roi = if state.initial_balance > Decimal::ZERO {
            profit_loss / state.initial_balance * Decimal::from(100)
        } else {
            Decimal::ZERO
        };
        Self {
            team_name: state.team.clone(),
            start_balance: state.initial_balance,
            final_balance: state.balance,
            profit_loss,
            roi,
            pnl_percent: state.pnl_percent(),
            total_trades: fills.len(),
            total_volume,
            avg_trade_size,
            buy_trades,
            sell_trades,
            products,
            final_inventory: state.inventory.clone(),
            server_time: now,
        }
    }
}

impl ServerMessage {
    pub fn error(code: ErrorCode, reason: impl Into<String>, cl_ord_id: Option<String>) -> Self {
        ServerMessage::Error(ErrorReport {
            code,
            reason: reason.into(),
            cl_ord_id,
            timestamp: Utc::now(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::LoginOk(_) => "LOGIN_OK",
            ServerMessage::OrderAck(_) => "ORDER_ACK",
            ServerMessage::Fill(_) => "FILL",
            ServerMessage::Ticker(_) => "TICKER",
            ServerMessage::Offer(_) => "OFFER",
            ServerMessage::Error(_) => "ERROR",
            ServerMessage::EventDelta(_) => "EVENT_DELTA",
            ServerMessage::BalanceUpdate(_) => "BALANCE_UPDATE",
            ServerMessage::InventoryUpdate(_) => "INVENTORY_UPDATE",
            ServerMessage::Pong(_) => "PONG",
            ServerMessage::AllOrders(_) => "ALL_ORDERS",
            ServerMessage::PerformanceReport(_) => "PERFORMANCE_REPORT",
        }
    }
}
