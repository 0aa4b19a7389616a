use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    errors::{EngineError, EngineResult},
    fill::short_uuid,
    hub::Hub,
    ledger::Ledger,
    messages::{OfferNotice, ServerMessage},
    orders::{Order, Price},
    product::Product,
    store::DurableStore,
};

/// A request to sell into a resting buy order, sent to chosen teams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    #[serde(rename = "offerId")]
    pub offer_id: String,
    pub buyer: String,
    #[serde(rename = "buyClOrdID")]
    pub buy_cl_ord_id: String,
    pub product: Product,
    pub quantity_requested: u64,
    pub max_price: Price,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Offer {
    /// `off-<unix seconds>-<8 hex chars>`
    pub fn next_id(now: DateTime<Utc>) -> String {
        format!("off-{}-{}", now.timestamp(), short_uuid())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| now > t)
    }
}

/// Highest price a buy order is offered at: its own limit, else 10% over mid, else
/// `default`.
pub fn offer_max_price(order: &Order, mid: Option<Price>, default: Price) -> Price {
    order
        .limit_price
        .or_else(|| mid.map(|m| m * Decimal::new(110, 2)))
        .unwrap_or(default)
}

/// Picks which teams hear about a resting buy.
#[async_trait]
pub trait CandidateSelector: Send + Sync {
    async fn candidates(&self, offer: &Offer) -> EngineResult<Vec<String>>;
}

/// Teams whose inventory already covers the requested quantity.
pub struct InventoryHolders {
    ledger: Arc<Ledger>,
}

impl InventoryHolders {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl CandidateSelector for InventoryHolders {
    async fn candidates(&self, offer: &Offer) -> EngineResult<Vec<String>> {
        Ok(self
            .ledger
            .holders_of(offer.product.code(), offer.quantity_requested))
    }
}

/// Teams with a sell fill in the product during the last `window`.
pub struct RecentSellers {
    store: Arc<dyn DurableStore>,
    window: ChronoDuration,
}

impl RecentSellers {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            window: ChronoDuration::hours(1),
        }
    }
}

#[async_trait]
impl CandidateSelector for RecentSellers {
    async fn candidates(&self, offer: &Offer) -> EngineResult<Vec<String>> {
        let since = offer.created_at - self.window;
        Ok(self.store.sellers_since(&offer.product, since).await?)
    }
}

/// A live offer and the teams it was sent to.
#[derive(Debug, Clone)]
pub struct ActiveOffer {
    pub offer: Offer,
    recipients: Vec<String>,
}

/// Holds live offers and tells candidates about them.
pub struct Negotiator {
    active: DashMap<String, ActiveOffer>,
    selector: Arc<dyn CandidateSelector>,
    ledger: Arc<Ledger>,
    hub: Arc<Hub>,
    timeout: Duration,
}

impl Negotiator {
    pub fn new(
        selector: Arc<dyn CandidateSelector>,
        ledger: Arc<Ledger>,
        hub: Arc<Hub>,
        timeout: Duration,
    ) -> Self {
        Self {
            active: DashMap::new(),
            selector,
            ledger,
            hub,
            timeout,
        }
    }

    /// Builds an offer for a resting buy and sends it to every candidate except the buyer.
    /// Returns `None` when nobody qualifies.
    pub async fn open(
        &self,
        order: &Order,
        max_price: Price,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Offer>> {
        let offer = Offer {
            offer_id: Offer::next_id(now),
            buyer: order.team.clone(),
            buy_cl_ord_id: order.cl_ord_id.clone(),
            product: order.product.clone(),
            quantity_requested: order.remaining(),
            max_price,
            created_at: now,
            expires_at: ChronoDuration::from_std(self.timeout)
                .ok()
                .map(|d| now + d),
        };
        let recipients: Vec<String> = self
            .selector
            .candidates(&offer)
            .await?
            .into_iter()
            .filter(|team| *team != order.team)
            .collect();
        if recipients.is_empty() {
            debug!(product = %offer.product, cl_ord_id = %order.cl_ord_id, "no candidates for offer");
            return Ok(None);
        }

        self.active.insert(
            offer.offer_id.clone(),
            ActiveOffer {
                offer: offer.clone(),
                recipients: recipients.clone(),
            },
        );
        let notice = ServerMessage::Offer(OfferNotice::from(&offer));
        let mut sent = 0;
        for team in &recipients {
            let _ = self
                .ledger
                .with_team(team, |s| s.add_offer(offer.clone()));
            sent += self.hub.send_to_team(team, notice.clone());
        }
        info!(
            offer_id = %offer.offer_id,
            product = %offer.product,
            buyer = %offer.buyer,
            candidates = recipients.len(),
            sent,
            "offer sent"
        );
        Ok(Some(offer))
    }

    /// Fire-and-forget variant of [`Negotiator::open`]; failures are only logged.
    pub fn spawn(self: &Arc<Self>, order: Order, max_price: Price) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.open(&order, max_price, Utc::now()).await {
                warn!(cl_ord_id = %order.cl_ord_id, error = %e, "offer negotiation failed");
            }
        });
    }

    /// The offer, if it exists and has not lapsed.
    pub fn live(&self, offer_id: &str, now: DateTime<Utc>) -> EngineResult<Offer> {
        match self.active.get(offer_id) {
            Some(a) if !a.offer.is_expired(now) => Ok(a.offer.clone()),
            _ => Err(EngineError::OfferExpired(offer_id.to_string())),
        }
    }

    /// Takes the offer out of circulation on behalf of `team`. While claimed, nobody
    /// else can answer it; finish with [`Negotiator::retire`] or [`Negotiator::restore`].
    pub fn claim(
        &self,
        offer_id: &str,
        team: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ActiveOffer> {
        {
            let Some(active) = self.active.get(offer_id) else {
                return Err(EngineError::OfferExpired(offer_id.to_string()));
            };
            if active.offer.is_expired(now) {
                return Err(EngineError::OfferExpired(offer_id.to_string()));
            }
            if !active.recipients.iter().any(|r| r == team) {
                return Err(EngineError::InvalidOrder(format!(
                    "offer {offer_id} was not made to {team}"
                )));
            }
        }
        self.active
            .remove(offer_id)
            .map(|(_, active)| active)
            .ok_or_else(|| EngineError::OfferExpired(offer_id.to_string()))
    }

    /// Puts a claimed offer back, e.g. when the trade it led to could not settle.
    pub fn restore(&self, active: ActiveOffer) {
        self.active.insert(active.offer.offer_id.clone(), active);
    }

    /// Clears a claimed offer from every recipient.
    pub fn retire(&self, active: ActiveOffer) {
        self.ledger.forget_offer(&active.offer.offer_id, &active.recipients);
    }

    /// Removes the offer for every recipient.
    pub fn withdraw(&self, offer_id: &str) -> Option<Offer> {
        let (_, active) = self.active.remove(offer_id)?;
        let offer = active.offer.clone();
        self.retire(active);
        Some(offer)
    }

    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|e| e.offer.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        let n = expired.iter().filter(|id| self.withdraw(id).is_some()).count();
        if n > 0 {
            debug!(count = n, "expired offers swept");
        }
        n
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub async fn run_sweeper(self: Arc<Self>, every: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_expired(Utc::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        orders::{OrderMode, OrderStatus, Side},
        team::Team,
    };
    use tokio::sync::mpsc;

    fn buy(team: &str, qty: u64, price: Option<i64>) -> Order {
        Order {
            cl_ord_id: "buy-1".into(),
            team: team.into(),
            side: Side::Buy,
            mode: if price.is_some() {
                OrderMode::Limit
            } else {
                OrderMode::Market
            },
            product: "GUACA".parse().unwrap(),
            quantity: qty,
            filled_qty: 0,
            limit_price: price.map(Price::from),
            message: String::new(),
            expires_at: None,
            created_at: Utc::now(),
            seq: 1,
            status: OrderStatus::Open,
        }
    }

    fn setup(timeout: Duration) -> (Arc<Ledger>, Arc<Hub>, Negotiator) {
        let ledger = Arc::new(Ledger::new());
        for (name, qty) in [("alpha", 50), ("beta", 20), ("gamma", 2)] {
            let mut t = Team::new(name, name, "x", Decimal::from(100));
            t.inventory.insert("GUACA".into(), qty);
            ledger.load_team(&t);
        }
        let hub = Arc::new(Hub::new());
        let selector = Arc::new(InventoryHolders::new(Arc::clone(&ledger)));
        let negotiator = Negotiator::new(selector, Arc::clone(&ledger), Arc::clone(&hub), timeout);
        (ledger, hub, negotiator)
    }

    #[test]
    fn max_price_prefers_limit_then_mid() {
        let default = Price::from(10);
        assert_eq!(offer_max_price(&buy("a", 1, Some(7)), Some(Price::from(20)), default), Price::from(7));
        assert_eq!(
            offer_max_price(&buy("a", 1, None), Some(Price::from(20)), default),
            Price::from(22)
        );
        assert_eq!(offer_max_price(&buy("a", 1, None), None, default), default);
    }

    #[tokio::test]
    async fn offer_goes_to_holders_but_not_buyer() {
        let (ledger, hub, negotiator) = setup(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("beta", tx);

        let offer = negotiator
            .open(&buy("alpha", 10, Some(12)), Price::from(12), Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert!(offer.offer_id.starts_with("off-"));
        let Ok(ServerMessage::Offer(notice)) = rx.try_recv() else {
            panic!("beta should get the offer");
        };
        assert_eq!(notice.quantity_requested, 10);
        assert_eq!(notice.expires_in, Some(5_000));
        assert!(ledger.snapshot("beta").unwrap().pending_offers.contains_key(&offer.offer_id));
        assert!(ledger.snapshot("alpha").unwrap().pending_offers.is_empty());
        assert!(ledger.snapshot("gamma").unwrap().pending_offers.is_empty());
    }

    #[tokio::test]
    async fn withdraw_clears_every_recipient() {
        let (ledger, _hub, negotiator) = setup(Duration::from_secs(5));
        let offer = negotiator
            .open(&buy("gamma", 5, None), Price::from(10), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(ledger.snapshot("alpha").unwrap().pending_offers.contains_key(&offer.offer_id));

        negotiator.withdraw(&offer.offer_id).unwrap();

        for team in ["alpha", "beta"] {
            assert!(ledger.snapshot(team).unwrap().pending_offers.is_empty());
        }
        assert!(negotiator.live(&offer.offer_id, Utc::now()).is_err());
    }

    #[tokio::test]
    async fn only_one_recipient_can_claim() {
        let (ledger, _hub, negotiator) = setup(Duration::from_secs(5));
        let offer = negotiator
            .open(&buy("gamma", 5, None), Price::from(10), Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            negotiator.claim(&offer.offer_id, "gamma", Utc::now()),
            Err(EngineError::InvalidOrder(_))
        ));
        let claimed = negotiator.claim(&offer.offer_id, "beta", Utc::now()).unwrap();
        assert!(matches!(
            negotiator.claim(&offer.offer_id, "alpha", Utc::now()),
            Err(EngineError::OfferExpired(_))
        ));

        negotiator.restore(claimed);
        let claimed = negotiator.claim(&offer.offer_id, "alpha", Utc::now()).unwrap();
        negotiator.retire(claimed);
        assert_eq!(negotiator.active_count(), 0);
        assert!(ledger.snapshot("beta").unwrap().pending_offers.is_empty());
    }

    #[tokio::test]
    async fn expired_offers_are_swept() {
        let (_ledger, _hub, negotiator) = setup(Duration::from_millis(10));
        let now = Utc::now();
        let offer = negotiator
            .open(&buy("gamma", 5, None), Price::from(10), now)
            .await
            .unwrap()
            .unwrap();

        let later = now + ChronoDuration::milliseconds(50);
        assert!(matches!(
            negotiator.live(&offer.offer_id, later),
            Err(EngineError::OfferExpired(_))
        ));
        assert_eq!(negotiator.sweep_expired(later), 1);
        assert_eq!(negotiator.active_count(), 0);
    }

    #[tokio::test]
    async fn no_candidates_no_offer() {
        let (_ledger, _hub, negotiator) = setup(Duration::from_secs(5));
        let none = negotiator
            .open(&buy("alpha", 100, Some(5)), Price::from(5), Utc::now())
            .await
            .unwrap();
        assert!(none.is_none());
        assert_eq!(negotiator.active_count(), 0);
    }
}
