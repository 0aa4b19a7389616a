#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exchange_engine::{
    config::EngineConfig,
    engine::Exchange,
    fill::Fill,
    hub::Hub,
    orders::{Order, OrderMode, OrderStatus, Price, Side},
    product::Product,
    production::Recipe,
    store::{DurableStore, ParityStore, StoreError, StoreResult, StoreWrite},
    team::Team,
};
use rust_decimal::Decimal;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tempfile::TempDir;

/// Parity store that can be told to fail every commit, or to apply the next write and
/// then report a timeout as if the reply were lost.
pub struct FlakyStore {
    inner: ParityStore,
    fail_commits: AtomicBool,
    drop_next_insert_reply: AtomicBool,
    drop_next_commit_reply: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: ParityStore) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
            drop_next_insert_reply: AtomicBool::new(false),
            drop_next_commit_reply: AtomicBool::new(false),
        }
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn drop_next_insert_reply(&self) {
        self.drop_next_insert_reply.store(true, Ordering::SeqCst);
    }

    pub fn drop_next_commit_reply(&self) {
        self.drop_next_commit_reply.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn team_by_token(&self, token: &str) -> StoreResult<Option<Team>> {
        self.inner.team_by_token(token).await
    }
    async fn team(&self, name: &str) -> StoreResult<Option<Team>> {
        self.inner.team(name).await
    }
    async fn teams(&self) -> StoreResult<Vec<Team>> {
        self.inner.teams().await
    }
    async fn put_team(&self, team: Team) -> StoreResult<()> {
        self.inner.put_team(team).await
    }
    async fn insert_order_if_absent(&self, order: Order) -> StoreResult<bool> {
        let created = self.inner.insert_order_if_absent(order).await?;
        if self.drop_next_insert_reply.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }
        Ok(created)
    }
    async fn order(&self, cl_ord_id: &str) -> StoreResult<Option<Order>> {
        self.inner.order(cl_ord_id).await
    }
    async fn open_orders(&self) -> StoreResult<Vec<Order>> {
        self.inner.open_orders().await
    }
    async fn commit(&self, batch: Vec<StoreWrite>) -> StoreResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("injected failure".into()));
        }
        self.inner.commit(batch).await?;
        if self.drop_next_commit_reply.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Timeout);
        }
        Ok(())
    }
    async fn fills_for_team_since(
        &self,
        team: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Fill>> {
        self.inner.fills_for_team_since(team, since).await
    }
    async fn sellers_since(
        &self,
        product: &Product,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        self.inner.sellers_since(product, since).await
    }
}

pub fn guaca() -> Product {
    "GUACA".parse().unwrap()
}

/// alpha: cash, no goods, can make GUACA (premium) and SEBO (basic).
/// beta, gamma: 20 GUACA each.
pub fn teams() -> Vec<Team> {
    let mut alpha = Team::new("alpha", "tok-alpha", "Avocultores", Decimal::from(1_000));
    alpha.authorized_products = vec![guaca(), "SEBO".parse().unwrap()];
    alpha.inventory.insert("FOSFO".into(), 12);
    alpha.inventory.insert("PITA".into(), 6);
    alpha.recipes.insert(
        "GUACA".into(),
        Recipe::premium(
            BTreeMap::from([("FOSFO".to_string(), 5), ("PITA".to_string(), 3)]),
            1.3,
        ),
    );
    alpha.recipes.insert("SEBO".into(), Recipe::basic());

    let mut beta = Team::new("beta", "tok-beta", "Monjes", Decimal::from(500));
    beta.authorized_products = vec![guaca()];
    beta.inventory.insert("GUACA".into(), 20);

    let mut gamma = Team::new("gamma", "tok-gamma", "Monjes", Decimal::from(500));
    gamma.authorized_products = vec![guaca()];
    gamma.inventory.insert("GUACA".into(), 20);

    vec![alpha, beta, gamma]
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        store_timeout_ms: 500,
        store_retries: 2,
        offer_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}

pub async fn seeded_store(dir: &TempDir) -> Arc<FlakyStore> {
    let store = Arc::new(FlakyStore::new(ParityStore::open(dir.path()).unwrap()));
    for team in teams() {
        store.put_team(team).await.unwrap();
    }
    store
}

pub async fn exchange_with(store: Arc<FlakyStore>, config: EngineConfig) -> Arc<Exchange> {
    let exchange = Arc::new(Exchange::new(config, store, Arc::new(Hub::new())));
    exchange.bootstrap().await.unwrap();
    exchange
}

pub async fn test_exchange() -> (Arc<Exchange>, Arc<FlakyStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir).await;
    let exchange = exchange_with(Arc::clone(&store), test_config()).await;
    (exchange, store, dir)
}

pub fn order(id: &str, team: &str, side: Side, price: Option<i64>, qty: u64) -> Order {
    Order {
        cl_ord_id: id.into(),
        team: team.into(),
        side,
        mode: if price.is_some() {
            OrderMode::Limit
        } else {
            OrderMode::Market
        },
        product: guaca(),
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
