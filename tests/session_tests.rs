mod common;

use std::sync::Arc;

use common::{exchange_with, seeded_store, test_config, test_exchange};
use exchange_engine::{
    config::EngineConfig,
    engine::Exchange,
    errors::ErrorCode,
    messages::ServerMessage,
    orders::{OrderStatus, Price, Side},
    session::{Flow, Session, SessionState},
};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn open_session(ex: &Arc<Exchange>) -> (Session, UnboundedReceiver<ServerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Session::new(Arc::clone(ex), tx), rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn error_code(msg: &ServerMessage) -> Option<ErrorCode> {
    match msg {
        ServerMessage::Error(e) => Some(e.code),
        _ => None,
    }
}

async fn logged_in(ex: &Arc<Exchange>, token: &str) -> (Session, UnboundedReceiver<ServerMessage>) {
    let (mut session, mut rx) = open_session(ex);
    let login = json!({ "type": "LOGIN", "token": token }).to_string();
    assert_eq!(session.handle_text(&login).await, Flow::Continue);
    assert!(matches!(drain(&mut rx).first(), Some(ServerMessage::LoginOk(_))));
    (session, rx)
}

fn order_json(id: &str, side: &str, price: i64, qty: i64) -> String {
    json!({
        "type": "ORDER",
        "clOrdID": id,
        "side": side,
        "mode": "LIMIT",
        "product": "GUACA",
        "qty": qty,
        "limitPrice": price,
    })
    .to_string()
}

#[tokio::test]
async fn login_reports_team_state() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut session, mut rx) = open_session(&ex);

    let flow = session
        .handle_text(r#"{"type":"LOGIN","token":"tok-beta","tz":"America/Bogota"}"#)
        .await;
    assert_eq!(flow, Flow::Continue);
    assert_eq!(
        session.state(),
        &SessionState::Authenticated {
            team: "beta".into()
        }
    );
    match drain(&mut rx).as_slice() {
        [ServerMessage::LoginOk(ok)] => {
            assert_eq!(ok.team, "beta");
            assert_eq!(ok.inventory.get("GUACA"), Some(&20));
        }
        other => panic!("expected LOGIN_OK, got {other:?}"),
    }
    assert!(ex.hub().is_connected("beta"));
}

#[tokio::test]
async fn bad_token_closes_session() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut session, mut rx) = open_session(&ex);

    let flow = session
        .handle_text(r#"{"type":"LOGIN","token":"nope"}"#)
        .await;
    assert_eq!(flow, Flow::Close);
    assert_eq!(session.state(), &SessionState::Closed);
    let msgs = drain(&mut rx);
    assert_eq!(error_code(&msgs[0]), Some(ErrorCode::AuthFailed));

    let again = session
        .handle_text(r#"{"type":"LOGIN","token":"tok-beta"}"#)
        .await;
    assert_eq!(again, Flow::Close);
}

#[tokio::test]
async fn messages_before_login_are_refused() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut session, mut rx) = open_session(&ex);

    let flow = session.handle_text(&order_json("c-1", "BUY", 10, 1)).await;
    assert_eq!(flow, Flow::Continue);
    assert_eq!(session.state(), &SessionState::Unauthenticated);
    let msgs = drain(&mut rx);
    assert_eq!(error_code(&msgs[0]), Some(ErrorCode::AuthFailed));
}

#[tokio::test]
async fn garbage_and_unknown_types_are_invalid_messages() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut session, mut rx) = logged_in(&ex, "tok-alpha").await;

    session.handle_text("{not json").await;
    session.handle_text(r#"{"type":"SHOUT"}"#).await;
    session
        .handle_text(r#"{"type":"LOGIN","token":"tok-alpha"}"#)
        .await;
    let codes: Vec<_> = drain(&mut rx).iter().map(error_code).collect();
    assert_eq!(codes, vec![Some(ErrorCode::InvalidMessage); 3]);
}

#[tokio::test]
async fn ack_reaches_submitter_before_fill() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut seller, mut seller_rx) = logged_in(&ex, "tok-beta").await;
    let (mut buyer, mut buyer_rx) = logged_in(&ex, "tok-alpha").await;

    seller.handle_text(&order_json("s-1", "SELL", 9, 3)).await;
    buyer.handle_text(&order_json("b-1", "BUY", 9, 3)).await;

    let buyer_msgs = drain(&mut buyer_rx);
    let kinds: Vec<&str> = buyer_msgs
        .iter()
        .map(|m| m.kind())
        .filter(|k| *k != "TICKER")
        .collect();
    assert_eq!(
        kinds,
        vec!["ORDER_ACK", "FILL", "BALANCE_UPDATE", "INVENTORY_UPDATE"]
    );
    match &buyer_msgs[0] {
        ServerMessage::OrderAck(ack) => {
            assert_eq!(ack.cl_ord_id, "b-1");
            assert_eq!(ack.status, OrderStatus::Filled);
        }
        other => panic!("expected ORDER_ACK, got {other:?}"),
    }

    let seller_fill = drain(&mut seller_rx).into_iter().find_map(|m| match m {
        ServerMessage::Fill(f) => Some(f),
        _ => None,
    });
    let fill = seller_fill.expect("seller sees its fill");
    assert_eq!(fill.cl_ord_id, "s-1");
    assert_eq!(fill.counterparty, "alpha");
    assert_eq!(fill.remaining_qty, Some(0));
}

#[tokio::test]
async fn order_validation_errors_carry_client_id() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut session, mut rx) = logged_in(&ex, "tok-alpha").await;

    session.handle_text(&order_json("c-1", "BUY", 10, 0)).await;
    session
        .handle_text(
            &json!({
                "type": "ORDER", "clOrdID": "c-2", "side": "BUY", "mode": "LIMIT",
                "product": "PITA", "qty": 1, "limitPrice": 5
            })
            .to_string(),
        )
        .await;
    session
        .handle_text(
            &json!({
                "type": "ORDER", "clOrdID": "c-3", "side": "BUY", "mode": "LIMIT",
                "product": "GUACA", "qty": 1
            })
            .to_string(),
        )
        .await;

    let errors: Vec<(ErrorCode, Option<String>)> = drain(&mut rx)
        .into_iter()
        .filter_map(|m| match m {
            ServerMessage::Error(e) => Some((e.code, e.cl_ord_id)),
            _ => None,
        })
        .collect();
    assert_eq!(
        errors,
        vec![
            (ErrorCode::InvalidQuantity, Some("c-1".into())),
            (ErrorCode::InvalidProduct, Some("c-2".into())),
            (ErrorCode::InvalidOrder, Some("c-3".into())),
        ]
    );
}

#[tokio::test]
async fn orders_beyond_rate_limit_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir).await;
    let config = EngineConfig {
        orders_per_minute: 2,
        ..test_config()
    };
    let ex = exchange_with(store, config).await;
    let (mut session, mut rx) = logged_in(&ex, "tok-beta").await;

    for i in 0..3 {
        session
            .handle_text(&order_json(&format!("s-{i}"), "SELL", 20 + i, 1))
            .await;
    }
    let msgs = drain(&mut rx);
    let acks = msgs
        .iter()
        .filter(|m| matches!(m, ServerMessage::OrderAck(_)))
        .count();
    assert_eq!(acks, 2);
    assert!(
        msgs.iter()
            .any(|m| error_code(m) == Some(ErrorCode::RateLimitExceeded))
    );
}

#[tokio::test]
async fn production_resync_and_cancel_round_trip() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut session, mut rx) = logged_in(&ex, "tok-alpha").await;

    session
        .handle_text(r#"{"type":"PRODUCTION_UPDATE","product":"SEBO","quantity":4}"#)
        .await;
    match drain(&mut rx).as_slice() {
        [ServerMessage::InventoryUpdate(u)] => assert_eq!(u.inventory.get("SEBO"), Some(&4)),
        other => panic!("expected INVENTORY_UPDATE, got {other:?}"),
    }

    session.handle_text(&order_json("b-1", "BUY", 3, 2)).await;
    drain(&mut rx);
    session
        .handle_text(r#"{"type":"CANCEL","clOrdID":"b-1"}"#)
        .await;
    let msgs = drain(&mut rx);
    assert!(msgs.iter().any(|m| matches!(
        m,
        ServerMessage::OrderAck(a) if a.cl_ord_id == "b-1" && a.status == OrderStatus::Cancelled
    )));

    session.handle_text(r#"{"type":"RESYNC"}"#).await;
    match drain(&mut rx).as_slice() {
        [ServerMessage::EventDelta(d)] => assert!(d.events.is_empty()),
        other => panic!("expected EVENT_DELTA, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_leaves_the_hub() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut session, _rx) = logged_in(&ex, "tok-gamma").await;
    assert!(ex.hub().is_connected("gamma"));
    session.close();
    assert!(!ex.hub().is_connected("gamma"));
    assert_eq!(session.state(), &SessionState::Closed);
}

#[tokio::test]
async fn ping_gets_pong() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut session, mut rx) = logged_in(&ex, "tok-gamma").await;

    assert_eq!(session.handle_text(r#"{"type":"PING"}"#).await, Flow::Continue);
    assert!(matches!(drain(&mut rx).as_slice(), [ServerMessage::Pong(_)]));
}

#[tokio::test]
async fn all_orders_lists_only_own_live_orders() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut beta, mut beta_rx) = logged_in(&ex, "tok-beta").await;
    let (mut gamma, _gamma_rx) = logged_in(&ex, "tok-gamma").await;

    beta.handle_text(&order_json("s-1", "SELL", 30, 2)).await;
    beta.handle_text(&order_json("s-2", "SELL", 31, 4)).await;
    beta.handle_text(&order_json("s-3", "SELL", 32, 1)).await;
    beta.handle_text(r#"{"type":"CANCEL","clOrdID":"s-3"}"#).await;
    gamma.handle_text(&order_json("g-1", "SELL", 40, 1)).await;
    drain(&mut beta_rx);

    beta.handle_text(r#"{"type":"REQUEST_ALL_ORDERS"}"#).await;
    match drain(&mut beta_rx).as_slice() {
        [ServerMessage::AllOrders(all)] => {
            let ids: Vec<&str> = all.orders.iter().map(|o| o.cl_ord_id.as_str()).collect();
            assert_eq!(ids, vec!["s-1", "s-2"]);
            assert_eq!(all.orders[1].side, Side::Sell);
            assert_eq!(all.orders[1].quantity, 4);
            assert_eq!(all.orders[1].price, Some(Price::from(31)));
            assert_eq!(all.orders[1].status, OrderStatus::Open);
        }
        other => panic!("expected ALL_ORDERS, got {other:?}"),
    }
}

#[tokio::test]
async fn performance_report_covers_trades_and_marks_inventory() {
    let (ex, _store, _dir) = test_exchange().await;
    let (mut seller, _seller_rx) = logged_in(&ex, "tok-beta").await;
    let (mut buyer, mut buyer_rx) = logged_in(&ex, "tok-alpha").await;

    seller.handle_text(&order_json("s-1", "SELL", 9, 3)).await;
    buyer.handle_text(&order_json("b-1", "BUY", 9, 3)).await;
    // leave a 8/12 market so GUACA has a mid of 10
    seller.handle_text(&order_json("s-2", "SELL", 12, 1)).await;
    buyer.handle_text(&order_json("b-2", "BUY", 8, 1)).await;
    drain(&mut buyer_rx);

    buyer
        .handle_text(r#"{"type":"REQUEST_PERFORMANCE_REPORT"}"#)
        .await;
    let report = drain(&mut buyer_rx)
        .into_iter()
        .find_map(|m| match m {
            ServerMessage::PerformanceReport(r) => Some(r),
            _ => None,
        })
        .expect("performance report");
    assert_eq!(report.team_name, "alpha");
    assert_eq!(report.total_trades, 1);
    assert_eq!(report.buy_trades, 1);
    assert_eq!(report.sell_trades, 0);
    assert_eq!(report.total_volume, Price::from(27));
    assert_eq!(report.final_balance, Price::from(973));
    assert_eq!(report.profit_loss, Price::from(-27));
    assert_eq!(report.roi, Price::new(-27, 1));
    // (973 + 3 × 10 − 1000) / 1000 × 100
    assert_eq!(report.pnl_percent, Price::new(3, 1));
    assert_eq!(report.products.get("GUACA"), Some(&1));
    assert_eq!(report.final_inventory.get("GUACA"), Some(&3));

    buyer
        .handle_text(r#"{"type":"REQUEST_PERFORMANCE_REPORT","startTime":"yesterday"}"#)
        .await;
    let msgs = drain(&mut buyer_rx);
    assert_eq!(error_code(&msgs[0]), Some(ErrorCode::InvalidMessage));
}
