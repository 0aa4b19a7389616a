use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    engine::{AcceptOutcome, Exchange, MAX_ORDER_MESSAGE},
    errors::{EngineError, EngineResult, ErrorCode},
    hub::Outbox,
    messages::{
        AcceptOfferRequest, AllOrders, ClientMessage, EventDelta, InventoryUpdate, OrderAck,
        OrderRequest, OrderSummary, Pong, ServerMessage,
    },
    orders::{Order, OrderMode, OrderStatus, Price},
    product::Product,
    rate_limit::TokenBucket,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { team: String },
    Closed,
}

/// What the transport should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Turns a client ORDER into an [`Order`], checking fields in the order errors are
/// reported: id, product, quantity, price, message, expiry.
pub fn build_order(
    team: &str,
    req: OrderRequest,
    authorized: &[Product],
    now: DateTime<Utc>,
) -> EngineResult<Order> {
    if req.cl_ord_id.trim().is_empty() {
        return Err(EngineError::InvalidMessage("clOrdID is required".into()));
    }
    let product: Product = req
        .product
        .parse()
        .map_err(EngineError::InvalidProduct)?;
    if !authorized.contains(&product) {
        return Err(EngineError::InvalidProduct(format!(
            "{product} is not authorized for {team}"
        )));
    }
    if req.qty <= 0 {
        return Err(EngineError::InvalidQuantity("qty must be positive".into()));
    }
    let limit_price = match req.mode {
        OrderMode::Limit => match req.limit_price {
            Some(p) if p > Price::ZERO => Some(p),
            _ => {
                return Err(EngineError::InvalidOrder(
                    "LIMIT orders need a positive limitPrice".into(),
                ));
            }
        },
        OrderMode::Market => None,
    };
    let message = req.message.unwrap_or_default();
    if message.chars().count() > MAX_ORDER_MESSAGE {
        return Err(EngineError::InvalidOrder(format!(
            "message longer than {MAX_ORDER_MESSAGE} characters"
        )));
    }
    let expires_at = req
        .expires_at
        .as_deref()
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| EngineError::InvalidMessage(format!("expiresAt: {e}")))
        })
        .transpose()?;

    Ok(Order {
        cl_ord_id: req.cl_ord_id,
        team: team.to_string(),
        side: req.side,
        mode: req.mode,
        product,
        quantity: req.qty as u64,
        filled_qty: 0,
        limit_price,
        message,
        expires_at,
        created_at: now,
        seq: 0,
        status: OrderStatus::Open,
    })
}

/// One client connection's protocol state.
///
/// Replies go to the session's own outbox; messages for other parties (the counterparty's
/// FILL, tickers) go through the hub after the reply, so a client always sees its
/// ORDER_ACK before the FILLs of that order.
pub struct Session {
    exchange: Arc<Exchange>,
    outbox: Outbox,
    state: SessionState,
    bucket: TokenBucket,
    conn_id: Option<u64>,
    last_activity: Instant,
}

impl Session {
    pub fn new(exchange: Arc<Exchange>, outbox: Outbox) -> Self {
        let bucket = TokenBucket::per_minute(exchange.config().orders_per_minute);
        Self {
            exchange,
            outbox,
            state: SessionState::Unauthenticated,
            bucket,
            conn_id: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn team(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { team } => Some(team),
            _ => None,
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn send(&self, msg: ServerMessage) {
        let _ = self.outbox.send(msg);
    }

    fn send_error(&self, err: &EngineError, cl_ord_id: Option<String>) {
        self.send(ServerMessage::error(err.code(), err.to_string(), cl_ord_id));
    }

    pub async fn handle_text(&mut self, raw: &str) -> Flow {
        self.last_activity = Instant::now();
        if self.state == SessionState::Closed {
            return Flow::Close;
        }
        let msg = match serde_json::from_str::<ClientMessage>(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "unparseable client message");
                self.send(ServerMessage::error(
                    ErrorCode::InvalidMessage,
                    format!("invalid message: {e}"),
                    None,
                ));
                return Flow::Continue;
            }
        };

        let team = match &self.state {
            SessionState::Authenticated { team } => team.clone(),
            SessionState::Closed => return Flow::Close,
            SessionState::Unauthenticated => {
                if let ClientMessage::Login(login) = msg {
                    return self.login(&login.token).await;
                }
                self.send(ServerMessage::error(
                    ErrorCode::AuthFailed,
                    "must login first",
                    None,
                ));
                return Flow::Continue;
            }
        };

        debug!(team = %team, "routing client message");
        match msg {
            ClientMessage::Login(_) => self.send(ServerMessage::error(
                ErrorCode::InvalidMessage,
                "already logged in",
                None,
            )),
            ClientMessage::Order(req) => self.order(&team, req).await,
            ClientMessage::ProductionUpdate(req) => {
                match self.exchange.produce(&team, &req.product, req.quantity).await {
                    Ok(inventory) => self.send(ServerMessage::InventoryUpdate(InventoryUpdate {
                        inventory,
                        server_time: Utc::now(),
                    })),
                    Err(e) => self.send_error(&e, None),
                }
            }
            ClientMessage::AcceptOffer(req) => self.accept_offer(&team, &req).await,
            ClientMessage::Resync(req) => {
                match self.exchange.resync(&team, req.last_sync.as_deref()).await {
                    Ok(events) => self.send(ServerMessage::EventDelta(EventDelta {
                        events,
                        server_time: Utc::now(),
                    })),
                    Err(e) => self.send_error(&e, None),
                }
            }
            ClientMessage::Cancel(req) => match self.exchange.cancel(&team, &req.cl_ord_id).await {
                Ok((order, notices)) => {
                    self.send(ServerMessage::OrderAck(OrderAck {
                        cl_ord_id: order.cl_ord_id,
                        status: OrderStatus::Cancelled,
                        server_time: Utc::now(),
                    }));
                    self.exchange.deliver(notices);
                }
                Err(e) => self.send_error(&e, Some(req.cl_ord_id)),
            },
            ClientMessage::Ping => self.send(ServerMessage::Pong(Pong {
                timestamp: Utc::now(),
            })),
            ClientMessage::RequestAllOrders => match self.exchange.open_orders(&team).await {
                Ok(orders) => self.send(ServerMessage::AllOrders(AllOrders {
                    orders: orders.into_iter().map(OrderSummary::from).collect(),
                    server_time: Utc::now(),
                })),
                Err(e) => self.send_error(&e, None),
            },
            ClientMessage::RequestPerformanceReport(req) => {
                match self
                    .exchange
                    .performance(&team, req.start_time.as_deref())
                    .await
                {
                    Ok(report) => self.send(ServerMessage::PerformanceReport(report)),
                    Err(e) => self.send_error(&e, None),
                }
            }
        }
        Flow::Continue
    }

    async fn login(&mut self, token: &str) -> Flow {
        match self.exchange.login(token).await {
            Ok(ok) => {
                let team = ok.team.clone();
                self.send(ServerMessage::LoginOk(ok));
                self.conn_id = Some(self.exchange.hub().register(&team, self.outbox.clone()));
                self.state = SessionState::Authenticated { team };
                Flow::Continue
            }
            Err(e @ EngineError::AuthFailed(_)) => {
                warn!(error = %e, "login rejected");
                self.send_error(&e, None);
                self.close();
                Flow::Close
            }
            Err(e) => {
                self.send_error(&e, None);
                Flow::Continue
            }
        }
    }

    async fn order(&mut self, team: &str, req: OrderRequest) {
        let cl_ord_id = req.cl_ord_id.clone();
        let id = (!cl_ord_id.is_empty()).then(|| cl_ord_id.clone());
        if !self.bucket.try_acquire() {
            self.send_error(&EngineError::RateLimited, id);
            return;
        }
        let authorized = self
            .exchange
            .ledger()
            .snapshot(team)
            .map(|s| s.authorized_products)
            .unwrap_or_default();
        let order = match build_order(team, req, &authorized, Utc::now()) {
            Ok(order) => order,
            Err(e) => {
                self.send_error(&e, id);
                return;
            }
        };
        match self.exchange.submit_order(order).await {
            Ok(outcome) => {
                self.send(ServerMessage::OrderAck(OrderAck {
                    cl_ord_id,
                    status: outcome.status(),
                    server_time: Utc::now(),
                }));
                self.exchange.deliver(outcome.notices);
            }
            Err(e) => self.send_error(&e, id),
        }
    }

    async fn accept_offer(&mut self, team: &str, req: &AcceptOfferRequest) {
        match self.exchange.accept_offer(team, req).await {
            Ok(AcceptOutcome::Declined) => {}
            Ok(AcceptOutcome::Filled { fill, notices }) => {
                info!(offer_id = %req.offer_id, fill_id = %fill.fill_id, team, "offer accepted");
                self.exchange.deliver(notices);
            }
            Err(e) => self.send_error(&e, None),
        }
    }

    /// Leaves the hub and refuses further messages.
    pub fn close(&mut self) {
        if let (Some(conn), Some(team)) = (self.conn_id.take(), self.team()) {
            let team = team.to_string();
            self.exchange.hub().unregister(&team, conn);
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::Side;

    fn req(qty: i64, mode: OrderMode, price: Option<i64>) -> OrderRequest {
        OrderRequest {
            cl_ord_id: "c-1".into(),
            side: Side::Buy,
            mode,
            product: "GUACA".into(),
            qty,
            limit_price: price.map(Price::from),
            expires_at: None,
            message: None,
        }
    }

    fn authorized() -> Vec<Product> {
        vec!["GUACA".parse().unwrap()]
    }

    fn code(r: EngineResult<Order>) -> ErrorCode {
        r.unwrap_err().code()
    }

    #[test]
    fn valid_limit_order() {
        let order = build_order("alpha", req(5, OrderMode::Limit, Some(10)), &authorized(), Utc::now())
            .unwrap();
        assert_eq!(order.quantity, 5);
        assert_eq!(order.limit_price, Some(Price::from(10)));
        assert_eq!(order.status, OrderStatus::Open);
    }

    #[test]
    fn market_order_drops_price() {
        let order = build_order("alpha", req(5, OrderMode::Market, Some(10)), &authorized(), Utc::now())
            .unwrap();
        assert_eq!(order.limit_price, None);
    }

    #[test]
    fn validation_codes() {
        let now = Utc::now();
        let mut empty_id = req(5, OrderMode::Limit, Some(10));
        empty_id.cl_ord_id = String::new();
        assert_eq!(code(build_order("a", empty_id, &authorized(), now)), ErrorCode::InvalidMessage);

        let mut other = req(5, OrderMode::Limit, Some(10));
        other.product = "SEBO".into();
        assert_eq!(code(build_order("a", other, &authorized(), now)), ErrorCode::InvalidProduct);

        let mut bogus = req(5, OrderMode::Limit, Some(10));
        bogus.product = "no such".into();
        assert_eq!(code(build_order("a", bogus, &authorized(), now)), ErrorCode::InvalidProduct);

        assert_eq!(
            code(build_order("a", req(0, OrderMode::Limit, Some(10)), &authorized(), now)),
            ErrorCode::InvalidQuantity
        );
        assert_eq!(
            code(build_order("a", req(-3, OrderMode::Market, None), &authorized(), now)),
            ErrorCode::InvalidQuantity
        );
        assert_eq!(
            code(build_order("a", req(5, OrderMode::Limit, None), &authorized(), now)),
            ErrorCode::InvalidOrder
        );
        assert_eq!(
            code(build_order("a", req(5, OrderMode::Limit, Some(0)), &authorized(), now)),
            ErrorCode::InvalidOrder
        );

        let mut chatty = req(5, OrderMode::Limit, Some(10));
        chatty.message = Some("x".repeat(MAX_ORDER_MESSAGE + 1));
        assert_eq!(code(build_order("a", chatty, &authorized(), now)), ErrorCode::InvalidOrder);

        let mut bad_expiry = req(5, OrderMode::Limit, Some(10));
        bad_expiry.expires_at = Some("tomorrow".into());
        assert_eq!(
            code(build_order("a", bad_expiry, &authorized(), now)),
            ErrorCode::InvalidMessage
        );
    }

    #[test]
    fn expiry_is_parsed() {
        let mut r = req(5, OrderMode::Limit, Some(10));
        r.expires_at = Some("2030-01-01T00:00:00Z".into());
        let order = build_order("a", r, &authorized(), Utc::now()).unwrap();
        assert_eq!(order.expires_at.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }
}
