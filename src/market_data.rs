use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::{
    fill::Fill,
    orders::Price,
    product::Product,
};

/// Top of book and traded volume for one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub product: Product,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    pub mid: Option<Price>,
    #[serde(rename = "volume24h")]
    pub volume_24h: u64,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ProductStats {
    trades: VecDeque<(DateTime<Utc>, u64)>,
    last: Option<Ticker>,
}

impl ProductStats {
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(24);
        while self.trades.front().is_some_and(|(at, _)| *at < cutoff) {
            self.trades.pop_front();
        }
    }
}

/// Rolling 24h volume and the latest ticker per product.
#[derive(Debug, Default)]
pub struct MarketData {
    stats: DashMap<Product, ProductStats>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fill(&self, fill: &Fill) {
        let mut stats = self.stats.entry(fill.product.clone()).or_default();
        stats.trades.push_back((fill.executed_at, fill.quantity));
        stats.prune(fill.executed_at);
    }

    /// Builds and caches a ticker. Mid is only defined when both sides are quoted.
    pub fn ticker(
        &self,
        product: &Product,
        best_bid: Option<Price>,
        best_ask: Option<Price>,
        now: DateTime<Utc>,
    ) -> Ticker {
        let mut stats = self.stats.entry(product.clone()).or_default();
        stats.prune(now);
        let mid = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Price::from(2)),
            _ => None,
        };
        let ticker = Ticker {
            product: product.clone(),
            best_bid,
            best_ask,
            mid,
            volume_24h: stats.trades.iter().map(|(_, q)| q).sum(),
            server_time: now,
        };
        stats.last = Some(ticker.clone());
        ticker
    }

    /// Mid of the last published ticker for `product`.
    pub fn reference_price(&self, product: &Product) -> Option<Price> {
        self.stats
            .get(product)
            .and_then(|s| s.last.as_ref().and_then(|t| t.mid))
    }

    pub fn last_ticker(&self, product: &Product) -> Option<Ticker> {
        self.stats.get(product).and_then(|s| s.last.clone())
    }
}
