use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{DashMap, DashSet};
use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::{CandidateStrategy, EngineConfig, ProductionPolicy},
    errors::{EngineError, EngineResult},
    fill::Fill,
    hub::Hub,
    ledger::Ledger,
    market_data::{MarketData, Ticker},
    matching::{MatchDecision, Matcher, TradeDecision},
    messages::{
        AcceptOfferRequest, BalanceUpdate, FillReport, InventoryUpdate, LoginOk,
        PerformanceReport, ServerMessage,
    },
    offers::{CandidateSelector, InventoryHolders, Negotiator, RecentSellers, offer_max_price},
    orderbook::{BookDepth, OrderBook},
    orders::{Order, OrderMode, OrderStatus, Price, Side},
    product::Product,
    production::calculate_units,
    settlement::{Settled, Settlement},
    store::{DurableStore, StoreResult, StoreWrite, with_retry},
};

/// Longest free-text message an order may carry.
pub const MAX_ORDER_MESSAGE: usize = 200;

/// Who an outbound message is for.
#[derive(Debug, Clone, PartialEq)]
pub enum Audience {
    Team(String),
    All,
}

/// A message produced by an engine operation, delivered after the caller has answered
/// its own client.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub to: Audience,
    pub message: ServerMessage,
}

impl Notice {
    fn team(team: &str, message: ServerMessage) -> Self {
        Self {
            to: Audience::Team(team.to_string()),
            message,
        }
    }

    fn all(message: ServerMessage) -> Self {
        Self {
            to: Audience::All,
            message,
        }
    }
}

/// What happened to a submitted order.
#[derive(Debug, Clone)]
pub struct OrderOutcome {
    /// The order as it stands after matching.
    pub order: Order,
    pub fills: Vec<Fill>,
    pub notices: Vec<Notice>,
}

impl OrderOutcome {
    pub fn status(&self) -> OrderStatus {
        self.order.status
    }
}

#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    Declined,
    Filled { fill: Fill, notices: Vec<Notice> },
}

type BookHandle = Arc<Mutex<OrderBook>>;

/// The venue: books, ledger, matching and settlement behind one handle.
///
/// Everything touching one product's book runs under that book's lock, including the
/// durable commit of its fills, so matching on a product is strictly sequential. Different
/// products proceed in parallel.
pub struct Exchange {
    config: EngineConfig,
    books: DashMap<Product, BookHandle>,
    known_ids: DashSet<String>,
    seq: AtomicU64,
    ledger: Arc<Ledger>,
    matcher: Matcher,
    settlement: Settlement,
    negotiator: Arc<Negotiator>,
    market_data: MarketData,
    hub: Arc<Hub>,
    store: Arc<dyn DurableStore>,
}

impl Exchange {
    pub fn new(config: EngineConfig, store: Arc<dyn DurableStore>, hub: Arc<Hub>) -> Self {
        let ledger = Arc::new(Ledger::new());
        let selector: Arc<dyn CandidateSelector> = match config.candidate_strategy {
            CandidateStrategy::InventoryHolders => {
                Arc::new(InventoryHolders::new(Arc::clone(&ledger)))
            }
            CandidateStrategy::RecentSellers => Arc::new(RecentSellers::new(Arc::clone(&store))),
        };
        let negotiator = Arc::new(Negotiator::new(
            selector,
            Arc::clone(&ledger),
            Arc::clone(&hub),
            config.offer_timeout(),
        ));
        let settlement = Settlement::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            config.store_timeout(),
            config.store_retries,
        );
        Self {
            matcher: Matcher::new(config.default_price),
            books: DashMap::new(),
            known_ids: DashSet::new(),
            seq: AtomicU64::new(1),
            ledger,
            settlement,
            negotiator,
            market_data: MarketData::new(),
            hub,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    fn book(&self, product: &Product) -> BookHandle {
        self.books
            .entry(product.clone())
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(product.clone()))))
            .clone()
    }

    async fn durable<T, F, Fut>(&self, op: &'static str, call: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        with_retry(op, self.config.store_timeout(), self.config.store_retries, call)
            .await
            .map_err(|e| EngineError::ServiceUnavailable(e.to_string()))
    }

    /// Rebuilds the ledger and books from the store. Call once before serving.
    pub async fn bootstrap(&self) -> EngineResult<()> {
        let teams = self.durable("load_teams", || self.store.teams()).await?;
        for team in &teams {
            self.ledger.load_team(team);
        }

        let mut open = self.durable("load_open_orders", || self.store.open_orders()).await?;
        open.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));
        let max_seq = open.iter().map(|o| o.seq).max().unwrap_or(0);
        self.seq.fetch_max(max_seq + 1, Ordering::SeqCst);

        let mut rested = 0usize;
        for order in open {
            self.known_ids.insert(order.cl_ord_id.clone());
            let book = self.book(&order.product);
            let mut book = book.lock().await;
            match book.add_order(order) {
                Ok(()) => rested += 1,
                Err(e) => warn!(error = %e, "skipping stored order"),
            }
        }
        info!(teams = teams.len(), orders = rested, "exchange state restored");
        Ok(())
    }

    // ---- session entry points ----

    pub async fn login(&self, token: &str) -> EngineResult<LoginOk> {
        if token.trim().is_empty() {
            return Err(EngineError::AuthFailed("empty token".into()));
        }
        let team = self
            .durable("team_by_token", || self.store.team_by_token(token))
            .await?
            .ok_or_else(|| EngineError::AuthFailed("invalid token".into()))?;
        self.ledger.load_team(&team);
        let state = self
            .ledger
            .snapshot(&team.name)
            .ok_or_else(|| EngineError::AuthFailed("invalid token".into()))?;
        info!(team = %state.team, "team logged in");
        Ok(LoginOk {
            team: state.team,
            species: state.species,
            initial_balance: state.initial_balance,
            current_balance: state.balance,
            inventory: state.inventory,
            authorized_products: state.authorized_products,
            recipes: state.recipes,
            role: state.role,
            server_time: Utc::now(),
        })
    }

    /// Runs an order through admission, matching and resting.
    ///
    /// The returned outcome carries the notices (fills, balance and inventory updates,
    /// ticker) for the caller to deliver once it has acknowledged the order.
    pub async fn submit_order(&self, mut order: Order) -> EngineResult<OrderOutcome> {
        let now = Utc::now();
        if self.known_ids.contains(&order.cl_ord_id) {
            return Err(EngineError::DuplicateOrderId(order.cl_ord_id));
        }
        self.admit(&order)?;
        if !self.known_ids.insert(order.cl_ord_id.clone()) {
            return Err(EngineError::DuplicateOrderId(order.cl_ord_id));
        }
        order.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        if order.is_expired(now) {
            order.status = OrderStatus::Expired;
        }

        let created = match self
            .durable("insert_order", || self.store.insert_order_if_absent(order.clone()))
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.known_ids.remove(&order.cl_ord_id);
                return Err(e);
            }
        };
        if !created {
            return Err(EngineError::DuplicateOrderId(order.cl_ord_id));
        }
        if order.status == OrderStatus::Expired {
            info!(cl_ord_id = %order.cl_ord_id, "order expired on arrival");
            return Ok(OrderOutcome {
                order,
                fills: Vec::new(),
                notices: Vec::new(),
            });
        }

        let book = self.book(&order.product);
        let mut book = book.lock().await;
        self.purge_expired(&mut book, now).await;

        let mut fills = Vec::new();
        let mut notices = Vec::new();
        let mut skip = HashSet::new();
        while order.remaining() > 0 {
            let reference = self.market_data.reference_price(&order.product);
            let decision = match self.matcher.decide(&book, &order, reference, &skip) {
                MatchDecision::Trade(d) => d,
                MatchDecision::Rest => break,
            };
            match self.settlement.settle(&decision, Utc::now()).await {
                Ok(settled) => {
                    let resting = match order.side {
                        Side::Buy => settled.sell.clone(),
                        Side::Sell => settled.buy.clone(),
                    };
                    order = match order.side {
                        Side::Buy => settled.buy.clone(),
                        Side::Sell => settled.sell.clone(),
                    };
                    Self::update_resting(&mut book, resting);
                    self.market_data.record_fill(&settled.fill);
                    notices.extend(self.fill_notices(&settled));
                    fills.push(settled.fill);
                }
                Err(e) if Self::blames_resting(&e, &decision) => {
                    warn!(
                        cl_ord_id = %decision.resting().cl_ord_id,
                        team = %decision.resting().team,
                        error = %e,
                        "resting order cannot trade, skipping"
                    );
                    skip.insert(decision.resting().cl_ord_id.clone());
                }
                Err(e @ (EngineError::InsufficientBalance(_)
                | EngineError::InsufficientInventory { .. })) => {
                    warn!(cl_ord_id = %order.cl_ord_id, error = %e, "incoming order stops matching");
                    break;
                }
                Err(e) => {
                    order.status = OrderStatus::Cancelled;
                    let record = order.clone();
                    if let Err(persist) = self
                        .durable("cancel_order", || {
                            self.store.commit(vec![StoreWrite::UpsertOrder(record.clone())])
                        })
                        .await
                    {
                        error!(cl_ord_id = %order.cl_ord_id, error = %persist, "could not mark order cancelled");
                    }
                    notices.push(self.ticker_notice(&book, now));
                    self.deliver(notices);
                    return Err(e);
                }
            }
        }

        let rests = order.remaining() > 0;
        if rests {
            if let Err(e) = book.add_order(order.clone()) {
                error!(cl_ord_id = %order.cl_ord_id, error = %e, "could not rest order");
            }
        }
        notices.push(self.ticker_notice(&book, Utc::now()));
        drop(book);

        info!(
            cl_ord_id = %order.cl_ord_id,
            team = %order.team,
            product = %order.product,
            status = ?order.status,
            fills = fills.len(),
            "order processed"
        );

        if rests && order.side == Side::Buy {
            let mid = self.market_data.reference_price(&order.product);
            let max_price = offer_max_price(&order, mid, self.config.default_price);
            self.negotiator.spawn(order.clone(), max_price);
        }
        Ok(OrderOutcome {
            order,
            fills,
            notices,
        })
    }

    /// Cancels a resting order owned by `team`.
    pub async fn cancel(&self, team: &str, cl_ord_id: &str) -> EngineResult<(Order, Vec<Notice>)> {
        let stored = self
            .durable("get_order", || self.store.order(cl_ord_id))
            .await?
            .ok_or_else(|| EngineError::InvalidOrder(format!("unknown order {cl_ord_id}")))?;
        if stored.team != team {
            return Err(EngineError::InvalidOrder(format!(
                "order {cl_ord_id} belongs to another team"
            )));
        }
        if stored.status.is_terminal() {
            return Err(EngineError::InvalidOrder(format!(
                "order {cl_ord_id} is already {:?}",
                stored.status
            )));
        }

        let book = self.book(&stored.product);
        let mut book = book.lock().await;
        let mut order = book
            .remove(cl_ord_id)
            .ok_or_else(|| EngineError::InvalidOrder(format!("order {cl_ord_id} is not resting")))?;
        let previous = order.status;
        order.status = OrderStatus::Cancelled;
        let record = order.clone();
        if let Err(e) = self
            .durable("cancel_order", || {
                self.store.commit(vec![StoreWrite::UpsertOrder(record.clone())])
            })
            .await
        {
            order.status = previous;
            if let Err(restore) = book.add_order(order) {
                error!(error = %restore, "could not restore order after failed cancel");
            }
            return Err(e);
        }
        let notices = vec![self.ticker_notice(&book, Utc::now())];
        info!(cl_ord_id, team, "order cancelled");
        Ok((order, notices))
    }

    /// Produces `quantity` units of `product` for `team` using the team's recipe.
    pub async fn produce(
        &self,
        team: &str,
        product: &str,
        quantity: i64,
    ) -> EngineResult<BTreeMap<String, u64>> {
        if quantity <= 0 {
            return Err(EngineError::InvalidQuantity("quantity must be positive".into()));
        }
        let quantity = quantity as u64;
        let (recipe, role) = self
            .ledger
            .with_team(team, |s| (s.recipes.get(product).cloned(), s.role))?;
        let recipe = recipe.ok_or_else(|| EngineError::UnauthorizedProduction {
            team: team.to_string(),
            product: product.to_string(),
        })?;
        if self.config.production_policy == ProductionPolicy::CappedByYield {
            let cap = calculate_units(&role);
            if quantity > cap {
                return Err(EngineError::InvalidQuantity(format!(
                    "declared {quantity} exceeds yield {cap}"
                )));
            }
        }
        let plan = recipe.plan(quantity)?;

        self.ledger.with_team(team, |s| -> EngineResult<()> {
            for (ingredient, need) in &plan.consumed {
                let available = s.held(ingredient);
                if available < *need {
                    return Err(EngineError::InsufficientInventory {
                        team: team.to_string(),
                        product: ingredient.clone(),
                        needed: *need,
                        available,
                    });
                }
            }
            for (ingredient, need) in &plan.consumed {
                s.remove_inventory(ingredient, *need)?;
            }
            s.add_inventory(product, plan.produced);
            Ok(())
        })??;

        let mut delta: BTreeMap<String, i64> = plan
            .consumed
            .iter()
            .map(|(p, q)| (p.clone(), -(*q as i64)))
            .collect();
        *delta.entry(product.to_string()).or_insert(0) += plan.produced as i64;
        let batch = vec![
            StoreWrite::AdjustHoldings {
                team: team.to_string(),
                balance_delta: Price::ZERO,
                inventory_delta: delta,
            },
            StoreWrite::MarkEvent(format!("prod-{}", Uuid::new_v4())),
        ];
        if let Err(e) = self
            .durable("commit_production", || self.store.commit(batch.clone()))
            .await
        {
            let _ = self.ledger.with_team(team, |s| {
                if s.remove_inventory(product, plan.produced).is_err() {
                    error!(team, product, "production rollback found less than produced");
                }
                for (ingredient, need) in &plan.consumed {
                    s.add_inventory(ingredient, *need);
                }
            });
            return Err(e);
        }

        info!(team, product, declared = quantity, produced = plan.produced, "production recorded");
        self.ledger.with_team(team, |s| s.inventory.clone())
    }

    /// Answers an OFFER on behalf of `team`.
    ///
    /// The offer is claimed under the product's book lock, so of several concurrent
    /// acceptances exactly one trades. Only teams the offer was sent to may answer it.
    pub async fn accept_offer(
        &self,
        team: &str,
        req: &AcceptOfferRequest,
    ) -> EngineResult<AcceptOutcome> {
        let now = Utc::now();
        if !req.accept {
            let claimed = self.negotiator.claim(&req.offer_id, team, now)?;
            self.negotiator.retire(claimed);
            debug!(offer_id = %req.offer_id, team, "offer declined");
            return Ok(AcceptOutcome::Declined);
        }
        let offer = self.negotiator.live(&req.offer_id, now)?;
        let quantity = match req.quantity_offered {
            Some(q) if q > 0 => q as u64,
            _ => return Err(EngineError::InvalidOrder("quantityOffered must be positive".into())),
        };
        let price = match req.price_offered {
            Some(p) if p > Price::ZERO && p <= offer.max_price => p,
            _ => {
                return Err(EngineError::InvalidOrder(format!(
                    "priceOffered must be in (0, {}]",
                    offer.max_price
                )));
            }
        };

        let book = self.book(&offer.product);
        let mut book = book.lock().await;
        let now = Utc::now();
        self.purge_expired(&mut book, now).await;
        let claimed = self.negotiator.claim(&offer.offer_id, team, now)?;
        let Some(buy) = book.get(&offer.buy_cl_ord_id).cloned() else {
            self.negotiator.retire(claimed);
            return Err(EngineError::OfferExpired(offer.offer_id));
        };
        let trade_qty = quantity.min(buy.remaining());
        let sell = Order {
            cl_ord_id: format!("{}-{}", offer.offer_id, team),
            team: team.to_string(),
            side: Side::Sell,
            mode: OrderMode::Limit,
            product: offer.product.clone(),
            quantity: trade_qty,
            filled_qty: 0,
            limit_price: Some(price),
            message: String::new(),
            expires_at: None,
            created_at: now,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            status: OrderStatus::Open,
        };
        let decision = TradeDecision {
            buy,
            sell,
            price,
            quantity: trade_qty,
            aggressor: Side::Sell,
        };
        let settled = match self.settlement.settle(&decision, Utc::now()).await {
            Ok(settled) => settled,
            Err(e) => {
                self.negotiator.restore(claimed);
                return Err(e);
            }
        };
        Self::update_resting(&mut book, settled.buy.clone());
        self.negotiator.retire(claimed);
        self.market_data.record_fill(&settled.fill);

        let mut notices = self.fill_notices(&settled);
        notices.push(self.ticker_notice(&book, Utc::now()));
        Ok(AcceptOutcome::Filled {
            fill: settled.fill,
            notices,
        })
    }

    /// Fills involving `team` executed strictly after `last_sync`, oldest first.
    pub async fn resync(&self, team: &str, last_sync: Option<&str>) -> EngineResult<Vec<FillReport>> {
        let since = Self::since(last_sync, "lastSync")?;
        let fills = self
            .durable("fills_since", || self.store.fills_for_team_since(team, since))
            .await?;
        Ok(fills
            .iter()
            .map(|f| {
                let side = if f.buyer == team { Side::Buy } else { Side::Sell };
                FillReport::from_fill(f, side)
            })
            .collect())
    }

    /// The team's orders that are still live, oldest first.
    pub async fn open_orders(&self, team: &str) -> EngineResult<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .durable("open_orders", || self.store.open_orders())
            .await?
            .into_iter()
            .filter(|o| o.team == team)
            .collect();
        orders.sort_by_key(|o| o.seq);
        Ok(orders)
    }

    /// Trading results of `team` over its fills strictly after `start_time`.
    pub async fn performance(
        &self,
        team: &str,
        start_time: Option<&str>,
    ) -> EngineResult<PerformanceReport> {
        let since = Self::since(start_time, "startTime")?;
        let state = self
            .ledger
            .snapshot(team)
            .ok_or_else(|| EngineError::InvalidOrder(format!("unknown team {team}")))?;
        let fills = self
            .durable("fills_since", || self.store.fills_for_team_since(team, since))
            .await?;
        Ok(PerformanceReport::new(&state, &fills, Utc::now()))
    }

    pub async fn book_depth(&self, product: &Product) -> Option<BookDepth> {
        let book = self.books.get(product).map(|b| Arc::clone(b.value()))?;
        let book = book.lock().await;
        Some(book.depth())
    }

    // ---- background work ----

    /// Publishes a TICKER for every configured product and every product with a book.
    pub async fn publish_tickers(&self) {
        let mut products: Vec<Product> = self.config.products.clone();
        for entry in self.books.iter() {
            if !products.contains(entry.key()) {
                products.push(entry.key().clone());
            }
        }
        for product in products {
            let book = self.book(&product);
            let book = book.lock().await;
            let notice = self.ticker_notice(&book, Utc::now());
            drop(book);
            self.deliver(vec![notice]);
        }
    }

    pub async fn run_ticker(self: Arc<Self>, every: Duration, token: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.publish_tickers().await,
            }
        }
    }

    /// Sends notices through the hub.
    pub fn deliver(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice.to {
                Audience::Team(team) => {
                    self.hub.send_to_team(&team, notice.message);
                }
                Audience::All => self.hub.broadcast(notice.message),
            }
        }
    }

    // ---- helpers ----

    /// Parses an RFC 3339 lower bound; absent means the last 24 hours.
    fn since(raw: Option<&str>, field: &str) -> EngineResult<DateTime<Utc>> {
        match raw {
            Some(raw) => Ok(DateTime::parse_from_rfc3339(raw)
                .map_err(|e| EngineError::InvalidMessage(format!("{field}: {e}")))?
                .with_timezone(&Utc)),
            None => Ok(Utc::now() - ChronoDuration::hours(24)),
        }
    }

    fn admit(&self, order: &Order) -> EngineResult<()> {
        let state = self
            .ledger
            .snapshot(&order.team)
            .ok_or_else(|| EngineError::InvalidOrder(format!("unknown team {}", order.team)))?;
        match order.side {
            Side::Sell => {
                let available = state.held(order.product.code());
                if available < order.quantity {
                    return Err(EngineError::InsufficientInventory {
                        team: order.team.clone(),
                        product: order.product.to_string(),
                        needed: order.quantity,
                        available,
                    });
                }
            }
            Side::Buy => {
                let unit = match order.limit_price {
                    Some(p) => p,
                    None => self
                        .market_data
                        .reference_price(&order.product)
                        .unwrap_or(self.config.market_buy_estimate),
                };
                let cost = unit * Price::from(order.quantity);
                if !state.can_afford(cost) {
                    return Err(EngineError::InsufficientBalance(format!(
                        "balance {} cannot cover {}",
                        state.balance, cost
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether a settlement failure is the resting side's fault, so matching can move on.
    fn blames_resting(err: &EngineError, decision: &TradeDecision) -> bool {
        let resting = decision.resting();
        match err {
            EngineError::InsufficientInventory { team, .. } => *team == resting.team,
            EngineError::InsufficientBalance(_) => resting.side == Side::Buy,
            _ => false,
        }
    }

    fn update_resting(book: &mut OrderBook, resting: Order) {
        if resting.remaining() == 0 {
            book.remove(&resting.cl_ord_id);
        } else if let Some(slot) = book.get_mut(&resting.cl_ord_id) {
            *slot = resting;
        }
    }

    async fn purge_expired(&self, book: &mut OrderBook, now: DateTime<Utc>) {
        let expired = book.purge_expired(now);
        if expired.is_empty() {
            return;
        }
        let batch: Vec<StoreWrite> = expired
            .into_iter()
            .map(|mut o| {
                o.status = OrderStatus::Expired;
                StoreWrite::UpsertOrder(o)
            })
            .collect();
        let count = batch.len();
        match self
            .durable("expire_orders", || self.store.commit(batch.clone()))
            .await
        {
            Ok(()) => info!(product = %book.product, count, "expired orders purged"),
            Err(e) => warn!(product = %book.product, error = %e, "expired orders not persisted"),
        }
    }

    fn fill_notices(&self, settled: &Settled) -> Vec<Notice> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(6);
        for (order, side) in [(&settled.buy, Side::Buy), (&settled.sell, Side::Sell)] {
            let report = FillReport::from_fill(&settled.fill, side).with_progress(order);
            out.push(Notice::team(&order.team, ServerMessage::Fill(report)));
            if let Some(state) = self.ledger.snapshot(&order.team) {
                out.push(Notice::team(
                    &order.team,
                    ServerMessage::BalanceUpdate(BalanceUpdate {
                        balance: state.balance,
                        server_time: now,
                    }),
                ));
                out.push(Notice::team(
                    &order.team,
                    ServerMessage::InventoryUpdate(InventoryUpdate {
                        inventory: state.inventory,
                        server_time: now,
                    }),
                ));
            }
        }
        out
    }

    fn ticker_notice(&self, book: &OrderBook, now: DateTime<Utc>) -> Notice {
        let ticker: Ticker =
            self.market_data
                .ticker(&book.product, book.best_bid(), book.best_ask(), now);
        self.ledger.broadcast_ticker(&ticker);
        Notice::all(ServerMessage::Ticker(ticker))
    }
}
