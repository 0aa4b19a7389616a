use axum::{
    Json, Router, debug_handler,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    messages::ServerMessage,
    orderbook::BookDepth,
    product::Product,
    session::{Flow, Session},
    state::AppState,
};

/// Errors returned by the plain HTTP endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

#[debug_handler]
pub async fn get_book(
    State(state): State<AppState>,
    Path(product): Path<String>,
) -> Result<Json<BookDepth>, ApiError> {
    let product: Product = product.parse().map_err(ApiError::BadRequest)?;
    let depth = state
        .exchange
        .book_depth(&product)
        .await
        .unwrap_or_else(|| BookDepth {
            product: product.to_string(),
            ..BookDepth::default()
        });
    Ok(Json(depth))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!(kind = msg.kind(), error = %e, "could not encode outbound message");
            None
        }
    }
}

/// Drives one client session over a WebSocket.
///
/// Inbound text frames go to the [`Session`]; everything addressed to the client (direct
/// replies and hub traffic) arrives on the session's outbox and is written out in order.
/// The connection is dropped after `session_idle_timeout` without inbound traffic.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut session = Session::new(state.exchange.clone(), tx);
    let idle = state.exchange.config().session_idle_timeout();
    let idle = (!idle.is_zero()).then_some(idle);
    debug!("websocket session opened");

    loop {
        let deadline = idle.map(|d| tokio::time::Instant::from_std(session.last_activity() + d));
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if session.handle_text(text.as_str()).await == Flow::Close {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by axum; binary ignored
                Some(Err(e)) => {
                    warn!(error = %e, "websocket receive failed");
                    break;
                }
            },
            Some(out) = rx.recv() => {
                if let Some(frame) = encode(&out) {
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            _ = sleep_until(deadline) => {
                info!(team = ?session.team(), "closing idle session");
                break;
            }
        }
    }

    session.close();
    while let Ok(out) = rx.try_recv() {
        if let Some(frame) = encode(&out) {
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    }
    let _ = sender.send(Message::Close(None)).await;
    debug!("websocket session ended");
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/book/{product}", get(get_book))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
