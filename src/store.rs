use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parity_db::{ColId, Db, Options};
use rust_decimal::Decimal;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    fill::Fill,
    orders::Order,
    product::Product,
    team::Team,
};

const TEAMS: ColId = 0;
const TOKENS: ColId = 1;
const ORDERS: ColId = 2;
const FILLS: ColId = 3;
const EVENTS: ColId = 4;
const NUM_COLUMNS: u8 = 5;

/// Errors from the key/value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ParityDB error: {0}")]
    Parity(#[from] parity_db::Error),
    #[error("Serialization/Deserialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store call timed out")]
    Timeout,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("team {0} not found")]
    UnknownTeam(String),
    #[error("batch rejected: {0}")]
    Rejected(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One element of a transactional batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    InsertFill(Fill),
    UpsertOrder(Order),
    /// Signed changes to a team's balance and inventory.
    AdjustHoldings {
        team: String,
        balance_delta: Decimal,
        inventory_delta: BTreeMap<String, i64>,
    },
    /// Idempotency key for a batch that carries no fill.
    MarkEvent(String),
}

/// Durable persistence used by the exchange.
///
/// `commit` applies a whole batch or nothing. Implementations must make replaying a batch
/// whose fill or event marker is already stored a no-op, since a timed-out commit may be
/// retried after it actually landed.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn team_by_token(&self, token: &str) -> StoreResult<Option<Team>>;
    async fn team(&self, name: &str) -> StoreResult<Option<Team>>;
    async fn teams(&self) -> StoreResult<Vec<Team>>;
    async fn put_team(&self, team: Team) -> StoreResult<()>;
    /// Returns `false` when a different order with the same `clOrdID` already exists.
    /// Re-inserting the identical order (same team and sequence) reports `true`.
    async fn insert_order_if_absent(&self, order: Order) -> StoreResult<bool>;
    async fn order(&self, cl_ord_id: &str) -> StoreResult<Option<Order>>;
    /// Every order not yet in a terminal status.
    async fn open_orders(&self) -> StoreResult<Vec<Order>>;
    async fn commit(&self, batch: Vec<StoreWrite>) -> StoreResult<()>;
    /// Fills of `team` executed strictly after `since`, oldest first.
    async fn fills_for_team_since(&self, team: &str, since: DateTime<Utc>)
    -> StoreResult<Vec<Fill>>;
    /// Distinct teams that sold `product` strictly after `since`.
    async fn sellers_since(&self, product: &Product, since: DateTime<Utc>)
    -> StoreResult<Vec<String>>;
}

/// Runs a store call with a per-attempt timeout and linear back-off (100ms × attempt).
pub async fn with_retry<T, F, Fut>(
    op: &'static str,
    timeout: Duration,
    attempts: u32,
    mut call: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = attempts.max(1);
    let mut last = StoreError::Timeout;
    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!(op, attempt, error = %e, "store call failed");
                last = e;
            }
            Err(_) => {
                warn!(op, attempt, "store call timed out");
                last = StoreError::Timeout;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        }
    }
    error!(op, attempts, error = %last, "store retries exhausted");
    Err(last)
}

struct Inner {
    db: Db,
    // read-modify-write batches must not interleave
    write_lock: Mutex<()>,
}

/// A ParityDB-backed [`DurableStore`]. Values are JSON.
///
/// Columns: teams by name, team name by token, orders by `clOrdID`, fills keyed by
/// big-endian execution nanos followed by the fill id so a B-tree scan returns them in
/// time order, and applied event ids.
#[derive(Clone)]
pub struct ParityStore {
    inner: Arc<Inner>,
}

impl ParityStore {
    /// Open (or create) a ParityDB at `path`, every column with a B-tree index.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut opts = Options::with_columns(path.as_ref(), NUM_COLUMNS);
        for col in opts.columns.iter_mut() {
            col.btree_index = true;
        }
        let db = Db::open_or_create(&opts)?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                write_lock: Mutex::new(()),
            }),
        })
    }

    #[inline]
    fn nanos(ts: DateTime<Utc>) -> u64 {
        ts.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0) as u64
    }

    #[inline]
    fn fill_key(fill: &Fill) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + fill.fill_id.len());
        key.extend_from_slice(&Self::nanos(fill.executed_at).to_be_bytes());
        key.extend_from_slice(fill.fill_id.as_bytes());
        key
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> StoreResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl Inner {
    fn get_json<T: serde::de::DeserializeOwned>(&self, col: ColId, key: &[u8]) -> StoreResult<Option<T>> {
        match self.db.get(col, key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn scan<T: serde::de::DeserializeOwned>(&self, col: ColId) -> StoreResult<Vec<T>> {
        let mut iter = self.db.iter(col)?;
        iter.seek_to_first()?;
        let mut out = Vec::new();
        while let Some((_key, raw)) = iter.next()? {
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    /// Fills with an execution time strictly after `since`, in key order.
    fn fills_after(&self, since: DateTime<Utc>) -> StoreResult<Vec<Fill>> {
        let start = ParityStore::nanos(since).saturating_add(1);
        let mut iter = self.db.iter(FILLS)?;
        iter.seek(&start.to_be_bytes())?;
        let mut out = Vec::new();
        while let Some((_key, raw)) = iter.next()? {
            out.push(serde_json::from_slice::<Fill>(&raw)?);
        }
        Ok(out)
    }

    fn put_team(&self, team: &Team) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let value = serde_json::to_vec(team)?;
        self.db.commit(vec![
            (TEAMS, team.name.as_bytes().to_vec(), Some(value)),
            (TOKENS, team.token.as_bytes().to_vec(), Some(team.name.as_bytes().to_vec())),
        ])?;
        Ok(())
    }

    fn commit(&self, batch: Vec<StoreWrite>) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        // A replayed batch is recognised by its fill or its event marker.
        for write in &batch {
            let seen = match write {
                StoreWrite::InsertFill(fill) => {
                    self.db.get(FILLS, &ParityStore::fill_key(fill))?.is_some()
                }
                StoreWrite::MarkEvent(id) => self.db.get(EVENTS, id.as_bytes())?.is_some(),
                _ => false,
            };
            if seen {
                return Ok(());
            }
        }

        let mut teams: BTreeMap<String, Team> = BTreeMap::new();
        let mut tx: Vec<(ColId, Vec<u8>, Option<Vec<u8>>)> = Vec::with_capacity(batch.len());
        for write in batch {
            match write {
                StoreWrite::InsertFill(fill) => {
                    tx.push((FILLS, ParityStore::fill_key(&fill), Some(serde_json::to_vec(&fill)?)));
                }
                StoreWrite::UpsertOrder(order) => {
                    tx.push((
                        ORDERS,
                        order.cl_ord_id.as_bytes().to_vec(),
                        Some(serde_json::to_vec(&order)?),
                    ));
                }
                StoreWrite::AdjustHoldings {
                    team,
                    balance_delta,
                    inventory_delta,
                } => {
                    if !teams.contains_key(&team) {
                        let record: Team = self
                            .get_json(TEAMS, team.as_bytes())?
                            .ok_or_else(|| StoreError::UnknownTeam(team.clone()))?;
                        teams.insert(team.clone(), record);
                    }
                    let record = teams
                        .get_mut(&team)
                        .ok_or_else(|| StoreError::UnknownTeam(team.clone()))?;
                    apply_holdings(record, balance_delta, &inventory_delta)?;
                }
                StoreWrite::MarkEvent(id) => {
                    let at = Utc::now().to_rfc3339().into_bytes();
                    tx.push((EVENTS, id.into_bytes(), Some(at)));
                }
            }
        }
        for (name, team) in teams {
            tx.push((TEAMS, name.into_bytes(), Some(serde_json::to_vec(&team)?)));
        }
        self.db.commit(tx)?;
        Ok(())
    }
}

fn apply_holdings(
    team: &mut Team,
    balance_delta: Decimal,
    inventory_delta: &BTreeMap<String, i64>,
) -> StoreResult<()> {
    team.balance += balance_delta;
    for (product, delta) in inventory_delta {
        let held = team.inventory.get(product).copied().unwrap_or(0);
        let next = i128::from(held) + i128::from(*delta);
        if next < 0 {
            return Err(StoreError::Rejected(format!(
                "{} would hold {} {}",
                team.name, next, product
            )));
        }
        if next == 0 {
            team.inventory.remove(product);
        } else {
            team.inventory.insert(product.clone(), next as u64);
        }
    }
    Ok(())
}

#[async_trait]
impl DurableStore for ParityStore {
    async fn team_by_token(&self, token: &str) -> StoreResult<Option<Team>> {
        let token = token.to_string();
        self.blocking(move |inner| {
            let Some(name) = inner.db.get(TOKENS, token.as_bytes())? else {
                return Ok(None);
            };
            inner.get_json(TEAMS, &name)
        })
        .await
    }

    async fn team(&self, name: &str) -> StoreResult<Option<Team>> {
        let name = name.to_string();
        self.blocking(move |inner| inner.get_json(TEAMS, name.as_bytes()))
            .await
    }

    async fn teams(&self) -> StoreResult<Vec<Team>> {
        self.blocking(|inner| inner.scan(TEAMS)).await
    }

    async fn put_team(&self, team: Team) -> StoreResult<()> {
        self.blocking(move |inner| inner.put_team(&team)).await
    }

    async fn insert_order_if_absent(&self, order: Order) -> StoreResult<bool> {
        self.blocking(move |inner| {
            let _guard = inner.write_lock.lock().unwrap_or_else(|p| p.into_inner());
            let key = order.cl_ord_id.as_bytes().to_vec();
            if let Some(stored) = inner.get_json::<Order>(ORDERS, &key)? {
                // our own earlier attempt, landed before its reply was lost
                return Ok(stored.team == order.team && stored.seq == order.seq);
            }
            inner
                .db
                .commit(vec![(ORDERS, key, Some(serde_json::to_vec(&order)?))])?;
            Ok(true)
        })
        .await
    }

    async fn order(&self, cl_ord_id: &str) -> StoreResult<Option<Order>> {
        let id = cl_ord_id.to_string();
        self.blocking(move |inner| inner.get_json(ORDERS, id.as_bytes()))
            .await
    }

    async fn open_orders(&self) -> StoreResult<Vec<Order>> {
        self.blocking(|inner| {
            let all: Vec<Order> = inner.scan(ORDERS)?;
            Ok(all
                .into_iter()
                .filter(|o| !o.status.is_terminal())
                .collect())
        })
        .await
    }

    async fn commit(&self, batch: Vec<StoreWrite>) -> StoreResult<()> {
        self.blocking(move |inner| inner.commit(batch)).await
    }

    async fn fills_for_team_since(
        &self,
        team: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<Fill>> {
        let team = team.to_string();
        self.blocking(move |inner| {
            Ok(inner
                .fills_after(since)?
                .into_iter()
                .filter(|f| f.involves(&team))
                .collect())
        })
        .await
    }

    async fn sellers_since(
        &self,
        product: &Product,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let product = product.clone();
        self.blocking(move |inner| {
            let sellers: BTreeSet<String> = inner
                .fills_after(since)?
                .into_iter()
                .filter(|f| f.product == product)
                .map(|f| f.seller)
                .collect();
            Ok(sellers.into_iter().collect())
        })
        .await
    }
}
