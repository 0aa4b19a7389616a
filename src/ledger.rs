use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::error;

use crate::{
    errors::{EngineError, EngineResult},
    fill::Fill,
    market_data::Ticker,
    offers::Offer,
    orders::Price,
    product::Product,
    production::{Recipe, Role},
    team::Team,
};

/// How many fills each team keeps in memory.
pub const RECENT_FILLS: usize = 100;

/// Live view of one team: what it owns, what it has seen of the market, and the offers
/// waiting for its answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketState {
    pub team: String,
    pub species: String,
    pub balance: Decimal,
    pub initial_balance: Decimal,
    pub inventory: BTreeMap<String, u64>,
    pub tickers: BTreeMap<String, Ticker>,
    pub recent_fills: VecDeque<Fill>,
    pub pending_offers: BTreeMap<String, Offer>,
    pub authorized_products: Vec<Product>,
    pub recipes: BTreeMap<String, Recipe>,
    pub role: Role,
    pub updated_at: DateTime<Utc>,
}

impl MarketState {
    pub fn from_team(team: &Team) -> Self {
        Self {
            team: team.name.clone(),
            species: team.species.clone(),
            balance: team.balance,
            initial_balance: team.initial_balance,
            inventory: team.inventory.clone(),
            tickers: BTreeMap::new(),
            recent_fills: VecDeque::with_capacity(RECENT_FILLS),
            pending_offers: BTreeMap::new(),
            authorized_products: team.authorized_products.clone(),
            recipes: team.recipes.clone(),
            role: team.role.with_energy_defaults(),
            updated_at: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn held(&self, product: &str) -> u64 {
        self.inventory.get(product).copied().unwrap_or(0)
    }

    pub fn add_inventory(&mut self, product: &str, qty: u64) {
        *self.inventory.entry(product.to_string()).or_insert(0) += qty;
        self.touch();
    }

    /// Takes `qty` out of inventory. Fails without touching anything when less is held.
    pub fn remove_inventory(&mut self, product: &str, qty: u64) -> EngineResult<()> {
        let available = self.held(product);
        if available < qty {
            return Err(EngineError::InsufficientInventory {
                team: self.team.clone(),
                product: product.to_string(),
                needed: qty,
                available,
            });
        }
        if available == qty {
            self.inventory.remove(product);
        } else {
            self.inventory.insert(product.to_string(), available - qty);
        }
        self.touch();
        Ok(())
    }

    pub fn credit(&mut self, amount: Decimal) {
        self.balance += amount;
        self.touch();
    }

    pub fn debit(&mut self, amount: Decimal) -> EngineResult<()> {
        if self.balance < amount {
            return Err(EngineError::InsufficientBalance(format!(
                "{} has {}, needs {}",
                self.team, self.balance, amount
            )));
        }
        self.balance -= amount;
        self.touch();
        Ok(())
    }

    pub fn can_afford(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    pub fn update_ticker(&mut self, ticker: Ticker) {
        self.tickers.insert(ticker.product.to_string(), ticker);
    }

    pub fn mid_price(&self, product: &str) -> Option<Price> {
        self.tickers.get(product).and_then(|t| t.mid)
    }

    pub fn add_fill(&mut self, fill: Fill) {
        if self.recent_fills.len() == RECENT_FILLS {
            self.recent_fills.pop_front();
        }
        self.recent_fills.push_back(fill);
        self.touch();
    }

    pub fn add_offer(&mut self, offer: Offer) {
        self.pending_offers.insert(offer.offer_id.clone(), offer);
    }

    pub fn remove_offer(&mut self, offer_id: &str) -> Option<Offer> {
        self.pending_offers.remove(offer_id)
    }

    /// Independent copy; later changes to the live state do not show through.
    pub fn snapshot(&self) -> MarketState {
        self.clone()
    }

    /// Net worth change since the start, in percent, valuing inventory at known mids.
    /// Products without a mid count as zero.
    pub fn pnl_percent(&self) -> Decimal {
        if self.initial_balance.is_zero() {
            return Decimal::ZERO;
        }
        let holdings: Decimal = self
            .inventory
            .iter()
            .filter_map(|(p, qty)| self.mid_price(p).map(|mid| mid * Decimal::from(*qty)))
            .sum();
        (self.balance + holdings - self.initial_balance) / self.initial_balance
            * Decimal::from(100)
    }
}

/// Money and goods moving between two teams for one fill.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub buyer: String,
    pub seller: String,
    pub product: String,
    pub quantity: u64,
    pub notional: Decimal,
}

pub type TeamHandle = Arc<Mutex<MarketState>>;

fn lock(handle: &TeamHandle) -> MutexGuard<'_, MarketState> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// All teams' market state, one lock per team.
#[derive(Debug, Default)]
pub struct Ledger {
    teams: DashMap<String, TeamHandle>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a team unless it is already loaded. Live state wins over the record.
    pub fn load_team(&self, team: &Team) -> TeamHandle {
        self.teams
            .entry(team.name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(MarketState::from_team(team))))
            .clone()
    }

    pub fn get(&self, team: &str) -> Option<TeamHandle> {
        self.teams.get(team).map(|h| h.clone())
    }

    fn require(&self, team: &str) -> EngineResult<TeamHandle> {
        self.get(team)
            .ok_or_else(|| EngineError::InvalidOrder(format!("unknown team {team}")))
    }

    /// Runs `f` with the team's state locked.
    pub fn with_team<R>(
        &self,
        team: &str,
        f: impl FnOnce(&mut MarketState) -> R,
    ) -> EngineResult<R> {
        let handle = self.require(team)?;
        let mut state = lock(&handle);
        Ok(f(&mut state))
    }

    pub fn snapshot(&self, team: &str) -> Option<MarketState> {
        self.get(team).map(|h| lock(&h).snapshot())
    }

    /// Teams holding at least `min_qty` of `product`, in name order.
    pub fn holders_of(&self, product: &str, min_qty: u64) -> Vec<String> {
        let handles: Vec<(String, TeamHandle)> = self
            .teams
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut names: Vec<String> = handles
            .into_iter()
            .filter(|(_, h)| lock(h).held(product) >= min_qty)
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    pub fn broadcast_ticker(&self, ticker: &Ticker) {
        for handle in self.handles() {
            lock(&handle).update_ticker(ticker.clone());
        }
    }

    pub fn forget_offer(&self, offer_id: &str, recipients: &[String]) {
        for team in recipients {
            if let Some(handle) = self.get(team) {
                lock(&handle).remove_offer(offer_id);
            }
        }
    }

    fn handles(&self) -> Vec<TeamHandle> {
        self.teams.iter().map(|e| e.value().clone()).collect()
    }

    fn lock_pair<'a>(
        buyer: &'a TeamHandle,
        seller: &'a TeamHandle,
        buyer_first: bool,
    ) -> (MutexGuard<'a, MarketState>, MutexGuard<'a, MarketState>) {
        if buyer_first {
            let b = lock(buyer);
            let s = lock(seller);
            (b, s)
        } else {
            let s = lock(seller);
            let b = lock(buyer);
            (b, s)
        }
    }

    /// Moves goods and money for a fill, locking both teams in name order.
    ///
    /// Validates everything first: on error neither team changes.
    pub fn apply_transfer(&self, t: &Transfer) -> EngineResult<()> {
        if t.buyer == t.seller {
            return Err(EngineError::InvalidOrder("self-trade".into()));
        }
        let buyer = self.require(&t.buyer)?;
        let seller = self.require(&t.seller)?;
        let (mut b, mut s) = Self::lock_pair(&buyer, &seller, t.buyer < t.seller);

        let available = s.held(&t.product);
        if available < t.quantity {
            return Err(EngineError::InsufficientInventory {
                team: t.seller.clone(),
                product: t.product.clone(),
                needed: t.quantity,
                available,
            });
        }
        if !b.can_afford(t.notional) {
            return Err(EngineError::InsufficientBalance(format!(
                "{} has {}, needs {}",
                t.buyer, b.balance, t.notional
            )));
        }

        s.remove_inventory(&t.product, t.quantity)?;
        b.debit(t.notional)?;
        s.credit(t.notional);
        b.add_inventory(&t.product, t.quantity);
        Ok(())
    }

    /// Undoes a transfer applied by [`Ledger::apply_transfer`] after its durable commit
    /// failed.
    pub fn revert_transfer(&self, t: &Transfer) {
        let (Some(buyer), Some(seller)) = (self.get(&t.buyer), self.get(&t.seller)) else {
            error!(buyer = %t.buyer, seller = %t.seller, "cannot revert transfer: team missing");
            return;
        };
        let (mut b, mut s) = Self::lock_pair(&buyer, &seller, t.buyer < t.seller);

        if b.remove_inventory(&t.product, t.quantity).is_err() {
            error!(team = %t.buyer, product = %t.product, "revert found less inventory than transferred");
            b.inventory.remove(&t.product);
        }
        b.credit(t.notional);
        if s.balance < t.notional {
            error!(
                team = %t.seller,
                balance = %s.balance,
                notional = %t.notional,
                "revert found less cash than credited"
            );
            s.balance = Decimal::ZERO;
        } else {
            s.balance -= t.notional;
        }
        s.add_inventory(&t.product, t.quantity);
    }
}
