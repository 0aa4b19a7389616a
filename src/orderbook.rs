use crate::{
    orders::{Order, Price, Side},
    product::Product,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque, btree_map};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    #[error("duplicate order ID: {0}")]
    Duplicate(String),
    #[error("order {0} has nothing left to rest")]
    Exhausted(String),
}

/// One side of a product's book.
///
/// Priced orders live in `levels`, keyed by limit price in ascending order, each level a
/// FIFO queue. Resting MARKET orders carry no price and queue in `unpriced`, behind every
/// priced level.
#[derive(Debug, Default)]
pub struct BookSide {
    pub levels: BTreeMap<Price, VecDeque<Order>>,
    pub unpriced: VecDeque<Order>,
}

impl BookSide {
    fn queue_mut(&mut self, price: Option<Price>) -> Option<&mut VecDeque<Order>> {
        match price {
            Some(p) => self.levels.get_mut(&p),
            None => Some(&mut self.unpriced),
        }
    }

    fn len(&self) -> usize {
        self.levels.values().map(VecDeque::len).sum::<usize>() + self.unpriced.len()
    }
}

/// An [`OrderBook`] stores the **resting** orders of one product in two [`BookSide`]s:
/// - `bids` (buy orders)
/// - `asks` (sell orders)
///
/// Price levels hold FIFO queues so matching honours **price-time** priority. An index by
/// `clOrdID` keeps identifiers unique within the book and makes removal cheap.
#[derive(Debug)]
pub struct OrderBook {
    pub product: Product,
    pub bids: BookSide,
    pub asks: BookSide,
    index: HashMap<String, (Side, Option<Price>)>,
}

/// Internal enum to unify forward (`Values`) and reverse (`Rev<Values>`) level iteration.
///
/// - [`EitherIter::Fwd`] walks ascending prices (asks, for an incoming buy).
/// - [`EitherIter::Rev`] walks descending prices (bids, for an incoming sell).
enum EitherIter<'a> {
    Fwd(btree_map::Values<'a, Price, VecDeque<Order>>),
    Rev(std::iter::Rev<btree_map::Values<'a, Price, VecDeque<Order>>>),
}

impl<'a> Iterator for EitherIter<'a> {
    type Item = &'a VecDeque<Order>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            EitherIter::Fwd(iter) => iter.next(),
            EitherIter::Rev(iter) => iter.next(),
        }
    }
}

/// Aggregated view of a book, best level first on each side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookDepth {
    pub product: String,
    /// `(price, total remaining quantity)`, highest bid first.
    pub bids: Vec<(Price, u64)>,
    /// `(price, total remaining quantity)`, lowest ask first.
    pub asks: Vec<(Price, u64)>,
    /// Remaining quantity of resting MARKET buys and sells.
    pub market_bids: u64,
    pub market_asks: u64,
}

impl OrderBook {
    /// Creates a new, empty [`OrderBook`] for `product`.
    pub fn new(product: Product) -> Self {
        Self {
            product,
            bids: BookSide::default(),
            asks: BookSide::default(),
            index: HashMap::new(),
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BookSide {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Rests `order` at the back of its price level.
    ///
    /// Orders with a limit price go to their level; MARKET orders queue behind all priced
    /// levels. A `clOrdID` already in the book is rejected and the book is left unchanged.
    pub fn add_order(&mut self, order: Order) -> Result<(), BookError> {
        if self.index.contains_key(&order.cl_ord_id) {
            return Err(BookError::Duplicate(order.cl_ord_id));
        }
        if order.remaining() == 0 {
            return Err(BookError::Exhausted(order.cl_ord_id));
        }
        debug!(
            product = %self.product,
            cl_ord_id = %order.cl_ord_id,
            side = ?order.side,
            price = ?order.limit_price,
            remaining = order.remaining(),
            "resting order"
        );
        self.index
            .insert(order.cl_ord_id.clone(), (order.side, order.limit_price));
        let book_side = self.side_mut(order.side);
        match order.limit_price {
            Some(price) => book_side.levels.entry(price).or_default().push_back(order),
            None => book_side.unpriced.push_back(order),
        }
        Ok(())
    }

    /// Resting orders on the side opposite to `incoming`, in matching priority.
    ///
    /// # Behavior
    /// - incoming `Buy`: asks from lowest to highest price, then resting market sells
    /// - incoming `Sell`: bids from highest to lowest price, then resting market buys
    ///
    /// Within a level orders come oldest first.
    pub fn best_opposing(&self, incoming: Side) -> impl Iterator<Item = &Order> + '_ {
        let (book_side, levels) = match incoming {
            Side::Buy => (&self.asks, EitherIter::Fwd(self.asks.levels.values())),
            Side::Sell => (&self.bids, EitherIter::Rev(self.bids.levels.values().rev())),
        };
        levels.flat_map(|q| q.iter()).chain(book_side.unpriced.iter())
    }

    pub fn get(&self, cl_ord_id: &str) -> Option<&Order> {
        let (side, price) = *self.index.get(cl_ord_id)?;
        let book_side = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        let queue = match price {
            Some(p) => book_side.levels.get(&p)?,
            None => &book_side.unpriced,
        };
        queue.iter().find(|o| o.cl_ord_id == cl_ord_id)
    }

    /// Mutable access to a resting order, used to record partial fills in place so the
    /// order keeps its queue position.
    pub fn get_mut(&mut self, cl_ord_id: &str) -> Option<&mut Order> {
        let (side, price) = *self.index.get(cl_ord_id)?;
        self.side_mut(side)
            .queue_mut(price)?
            .iter_mut()
            .find(|o| o.cl_ord_id == cl_ord_id)
    }

    pub fn contains(&self, cl_ord_id: &str) -> bool {
        self.index.contains_key(cl_ord_id)
    }

    /// Deletes a resting order (fully filled, cancelled or expired) and prunes its level
    /// if it became empty.
    pub fn remove(&mut self, cl_ord_id: &str) -> Option<Order> {
        let (side, price) = self.index.remove(cl_ord_id)?;
        let book_side = self.side_mut(side);
        let queue = book_side.queue_mut(price)?;
        let pos = queue.iter().position(|o| o.cl_ord_id == cl_ord_id)?;
        let removed = queue.remove(pos);
        if let Some(p) = price {
            if queue.is_empty() {
                book_side.levels.remove(&p);
            }
        }
        removed
    }

    /// Removes and returns every resting order whose expiry is before `now`.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<Order> {
        let expired: Vec<String> = self
            .bids
            .levels
            .values()
            .chain(self.asks.levels.values())
            .flat_map(|q| q.iter())
            .chain(self.bids.unpriced.iter())
            .chain(self.asks.unpriced.iter())
            .filter(|o| o.is_expired(now))
            .map(|o| o.cl_ord_id.clone())
            .collect();
        expired.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Highest priced bid, ignoring resting market orders.
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.levels.keys().next_back().copied()
    }

    /// Lowest priced ask, ignoring resting market orders.
    pub fn best_ask(&self) -> Option<Price> {
        self.asks.levels.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn depth(&self) -> BookDepth {
        let total = |q: &VecDeque<Order>| q.iter().map(Order::remaining).sum::<u64>();
        BookDepth {
            product: self.product.to_string(),
            bids: self
                .bids
                .levels
                .iter()
                .rev()
                .map(|(p, q)| (*p, total(q)))
                .collect(),
            asks: self.asks.levels.iter().map(|(p, q)| (*p, total(q))).collect(),
            market_bids: total(&self.bids.unpriced),
            market_asks: total(&self.asks.unpriced),
        }
    }
}

//tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{OrderMode, OrderStatus};
    use chrono::Duration;

    fn px(n: i64) -> Price {
        Price::from(n)
    }

    fn product() -> Product {
        "GUACA".parse().unwrap()
    }

    fn sample_order(id: &str, team: &str, side: Side, price: Option<i64>, qty: u64) -> Order {
        Order {
            cl_ord_id: id.into(),
            team: team.into(),
            side,
            mode: if price.is_some() {
                OrderMode::Limit
            } else {
                OrderMode::Market
            },
            product: product(),
            quantity: qty,
            filled_qty: 0,
            limit_price: price.map(Price::from),
            message: String::new(),
            expires_at: None,
            created_at: Utc::now(),
            seq: 0,
            status: OrderStatus::Open,
        }
    }

    fn ids<'a>(it: impl Iterator<Item = &'a Order>) -> Vec<&'a str> {
        it.map(|o| o.cl_ord_id.as_str()).collect()
    }

    /// Asks come out cheapest first, resting market sells last.
    #[test]
    fn test_incoming_buy_sees_asks_ascending() {
        let mut ob = OrderBook::new(product());
        ob.add_order(sample_order("s3", "a", Side::Sell, Some(12), 1)).unwrap();
        ob.add_order(sample_order("m1", "a", Side::Sell, None, 1)).unwrap();
        ob.add_order(sample_order("s1", "b", Side::Sell, Some(10), 1)).unwrap();
        ob.add_order(sample_order("s2", "c", Side::Sell, Some(11), 1)).unwrap();

        assert_eq!(ids(ob.best_opposing(Side::Buy)), vec!["s1", "s2", "s3", "m1"]);
        assert_eq!(ob.best_ask(), Some(px(10)));
    }

    /// Bids come out richest first.
    #[test]
    fn test_incoming_sell_sees_bids_descending() {
        let mut ob = OrderBook::new(product());
        ob.add_order(sample_order("b1", "a", Side::Buy, Some(9), 1)).unwrap();
        ob.add_order(sample_order("b2", "b", Side::Buy, Some(11), 1)).unwrap();
        ob.add_order(sample_order("b3", "c", Side::Buy, Some(10), 1)).unwrap();

        assert_eq!(ids(ob.best_opposing(Side::Sell)), vec!["b2", "b3", "b1"]);
        assert_eq!(ob.best_bid(), Some(px(11)));
    }

    /// Tests that FIFO order is respected for multiple orders at the same price.
    #[test]
    fn test_queue_fairness_fifo_within_level() {
        let mut ob = OrderBook::new(product());
        ob.add_order(sample_order("first", "a", Side::Sell, Some(10), 4)).unwrap();
        ob.add_order(sample_order("second", "b", Side::Sell, Some(10), 6)).unwrap();

        assert_eq!(ids(ob.best_opposing(Side::Buy)), vec!["first", "second"]);
    }

    #[test]
    fn test_duplicate_id_rejected_and_book_unchanged() {
        let mut ob = OrderBook::new(product());
        ob.add_order(sample_order("x", "a", Side::Buy, Some(10), 5)).unwrap();

        let err = ob
            .add_order(sample_order("x", "b", Side::Sell, Some(20), 1))
            .unwrap_err();
        assert_eq!(err, BookError::Duplicate("x".into()));
        assert_eq!(ob.len(), 1);
        assert!(ob.asks.levels.is_empty());
    }

    #[test]
    fn test_cancel_existing_order_prunes_level() {
        let mut ob = OrderBook::new(product());
        ob.add_order(sample_order("42", "a", Side::Buy, Some(101), 10)).unwrap();

        let removed = ob.remove("42").unwrap();

        assert_eq!(removed.cl_ord_id, "42");
        assert!(!ob.bids.levels.contains_key(&px(101)));
        assert!(ob.is_empty());
    }

    #[test]
    fn test_cancel_nonexistent_order() {
        let mut ob = OrderBook::new(product());
        ob.add_order(sample_order("1", "a", Side::Sell, Some(99), 5)).unwrap();

        assert!(ob.remove("999").is_none());
        assert_eq!(ob.len(), 1);
    }

    #[test]
    fn test_partial_fill_in_place_keeps_priority() {
        let mut ob = OrderBook::new(product());
        ob.add_order(sample_order("old", "a", Side::Sell, Some(10), 5)).unwrap();
        ob.add_order(sample_order("new", "b", Side::Sell, Some(10), 5)).unwrap();

        ob.get_mut("old").unwrap().apply_fill(3);

        let first = ob.best_opposing(Side::Buy).next().unwrap();
        assert_eq!(first.cl_ord_id, "old");
        assert_eq!(first.remaining(), 2);
        assert_eq!(first.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_purge_expired_only_removes_past_expiry() {
        let mut ob = OrderBook::new(product());
        let now = Utc::now();
        let mut stale = sample_order("stale", "a", Side::Buy, None, 1);
        stale.expires_at = Some(now - Duration::seconds(1));
        let mut fresh = sample_order("fresh", "a", Side::Buy, Some(5), 1);
        fresh.expires_at = Some(now + Duration::seconds(60));
        ob.add_order(stale).unwrap();
        ob.add_order(fresh).unwrap();

        let purged = ob.purge_expired(now);

        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].cl_ord_id, "stale");
        assert!(ob.contains("fresh"));
        assert!(!ob.contains("stale"));
    }

    #[test]
    fn test_depth_aggregates_remaining() {
        let mut ob = OrderBook::new(product());
        ob.add_order(sample_order("a", "t1", Side::Buy, Some(10), 3)).unwrap();
        ob.add_order(sample_order("b", "t2", Side::Buy, Some(10), 2)).unwrap();
        ob.add_order(sample_order("c", "t3", Side::Buy, Some(12), 1)).unwrap();
        ob.add_order(sample_order("d", "t3", Side::Sell, None, 7)).unwrap();
        ob.get_mut("a").unwrap().apply_fill(1);

        let depth = ob.depth();
        assert_eq!(depth.bids, vec![(px(12), 1), (px(10), 4)]);
        assert!(depth.asks.is_empty());
        assert_eq!(depth.market_asks, 7);
    }
}
