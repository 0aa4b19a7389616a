use std::collections::HashSet;

use crate::{
    orderbook::OrderBook,
    orders::{Order, OrderMode, Price, Side},
};

/// Whether a buy and a sell may trade with each other.
///
/// - Orders of the same team never match.
/// - Two LIMIT orders need the buy limit at or above the sell limit.
/// - If either side is MARKET, price does not restrict eligibility.
pub fn can_match(buy: &Order, sell: &Order) -> bool {
    if buy.team == sell.team {
        return false;
    }
    match (buy.mode, sell.mode, buy.limit_price, sell.limit_price) {
        (OrderMode::Limit, OrderMode::Limit, Some(bid), Some(ask)) => bid >= ask,
        (OrderMode::Limit, OrderMode::Limit, _, _) => false,
        _ => true,
    }
}

/// The price a trade executes at, whichever side is the aggressor.
///
/// Resting limit first, then the incoming limit, then the reference mid, then `default`.
pub fn trade_price(
    resting: &Order,
    incoming: &Order,
    reference: Option<Price>,
    default: Price,
) -> Price {
    resting
        .limit_price
        .or(incoming.limit_price)
        .or(reference)
        .unwrap_or(default)
}

/// A trade the matcher wants settled. Nothing has been applied yet.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeDecision {
    pub buy: Order,
    pub sell: Order,
    pub price: Price,
    pub quantity: u64,
    /// Side of the incoming order.
    pub aggressor: Side,
}

impl TradeDecision {
    pub fn resting(&self) -> &Order {
        match self.aggressor {
            Side::Buy => &self.sell,
            Side::Sell => &self.buy,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Trade(TradeDecision),
    Rest,
}

#[derive(Debug, Clone)]
pub struct Matcher {
    default_price: Price,
}

impl Matcher {
    pub fn new(default_price: Price) -> Self {
        Self { default_price }
    }

    /// Finds the first resting order `incoming` can trade with.
    ///
    /// Walks the opposite side in price-time priority and stops at the first eligible
    /// order that is not in `skip`. Never mutates the book.
    pub fn decide(
        &self,
        book: &OrderBook,
        incoming: &Order,
        reference: Option<Price>,
        skip: &HashSet<String>,
    ) -> MatchDecision {
        if incoming.remaining() == 0 {
            return MatchDecision::Rest;
        }
        for resting in book.best_opposing(incoming.side) {
            if skip.contains(&resting.cl_ord_id) {
                continue;
            }
            let (buy, sell) = match incoming.side {
                Side::Buy => (incoming, resting),
                Side::Sell => (resting, incoming),
            };
            if !can_match(buy, sell) {
                continue;
            }
            let quantity = buy.remaining().min(sell.remaining());
            if quantity == 0 {
                continue;
            }
            return MatchDecision::Trade(TradeDecision {
                buy: buy.clone(),
                sell: sell.clone(),
                price: trade_price(resting, incoming, reference, self.default_price),
                quantity,
                aggressor: incoming.side,
            });
        }
        MatchDecision::Rest
    }
}
