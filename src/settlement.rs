use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{error, info};

use crate::{
    errors::{EngineError, EngineResult},
    fill::Fill,
    ledger::{Ledger, Transfer},
    matching::TradeDecision,
    orders::{Order, Price},
    store::{DurableStore, StoreWrite, with_retry},
};

/// Result of a committed trade: the fill plus both orders as they now stand.
#[derive(Debug, Clone)]
pub struct Settled {
    pub fill: Fill,
    pub buy: Order,
    pub sell: Order,
}

/// Applies a [`TradeDecision`] to the ledger and the durable store, all or nothing.
///
/// 1. Move money and goods between the two teams in memory. Validation failures stop here
///    with nothing changed.
/// 2. Commit fill, both orders and both holdings deltas as one batch, with timeout and
///    retries.
/// 3. If the commit never succeeds, put the ledger back and report SERVICE_UNAVAILABLE.
///
/// The caller updates the book only after `settle` returns `Ok`.
pub struct Settlement {
    ledger: Arc<Ledger>,
    store: Arc<dyn DurableStore>,
    timeout: Duration,
    attempts: u32,
}

impl Settlement {
    pub fn new(
        ledger: Arc<Ledger>,
        store: Arc<dyn DurableStore>,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            ledger,
            store,
            timeout,
            attempts,
        }
    }

    pub async fn settle(&self, decision: &TradeDecision, now: DateTime<Utc>) -> EngineResult<Settled> {
        let qty = decision.quantity;
        let notional = decision.price * Price::from(qty);
        let transfer = Transfer {
            buyer: decision.buy.team.clone(),
            seller: decision.sell.team.clone(),
            product: decision.buy.product.to_string(),
            quantity: qty,
            notional,
        };
        self.ledger.apply_transfer(&transfer)?;

        let mut buy = decision.buy.clone();
        let mut sell = decision.sell.clone();
        buy.apply_fill(qty);
        sell.apply_fill(qty);

        let fill = Fill {
            fill_id: Fill::next_id(now),
            buyer: buy.team.clone(),
            seller: sell.team.clone(),
            buyer_cl_ord_id: buy.cl_ord_id.clone(),
            seller_cl_ord_id: sell.cl_ord_id.clone(),
            product: buy.product.clone(),
            price: decision.price,
            quantity: qty,
            buyer_message: buy.message.clone(),
            seller_message: sell.message.clone(),
            executed_at: now,
        };

        let signed_qty = i64::try_from(qty)
            .map_err(|_| EngineError::InvalidQuantity("quantity too large".into()))?;
        let batch = vec![
            StoreWrite::InsertFill(fill.clone()),
            StoreWrite::UpsertOrder(buy.clone()),
            StoreWrite::UpsertOrder(sell.clone()),
            StoreWrite::AdjustHoldings {
                team: transfer.buyer.clone(),
                balance_delta: -notional,
                inventory_delta: BTreeMap::from([(transfer.product.clone(), signed_qty)]),
            },
            StoreWrite::AdjustHoldings {
                team: transfer.seller.clone(),
                balance_delta: notional,
                inventory_delta: BTreeMap::from([(transfer.product.clone(), -signed_qty)]),
            },
        ];

        let committed = with_retry("commit_fill", self.timeout, self.attempts, || {
            let store = Arc::clone(&self.store);
            let batch = batch.clone();
            async move { store.commit(batch).await }
        })
        .await;

        if let Err(e) = committed {
            self.ledger.revert_transfer(&transfer);
            error!(
                buyer = %transfer.buyer,
                seller = %transfer.seller,
                product = %transfer.product,
                error = %e,
                "fill not persisted, ledger rolled back"
            );
            return Err(EngineError::ServiceUnavailable(
                "could not persist trade".into(),
            ));
        }

        for team in [&fill.buyer, &fill.seller] {
            // both teams were just locked by apply_transfer, so they exist
            let _ = self.ledger.with_team(team, |s| s.add_fill(fill.clone()));
        }
        info!(
            fill_id = %fill.fill_id,
            product = %fill.product,
            buyer = %fill.buyer,
            seller = %fill.seller,
            price = %fill.price,
            qty = fill.quantity,
            "fill settled"
        );
        Ok(Settled { fill, buy, sell })
    }
}
