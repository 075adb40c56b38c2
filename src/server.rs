//! HTTP + WebSocket surface

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api;
use crate::runtime::Notice;
use crate::types::{AppState, ClientMessage, WsMessage};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/strategies", get(api::get_strategies))
        .route("/api/instruments", get(api::list_instruments))
        .route("/api/instruments/{symbol}", get(api::get_instrument))
        .route("/api/instruments/{symbol}/records", get(api::get_records))
        .route("/api/instruments/{symbol}/candles", post(api::post_candle))
        .route("/api/instruments/{symbol}/levels", post(api::post_levels))
        .route("/api/instruments/{symbol}/moving-averages", post(api::post_moving_averages))
        .route("/api/instruments/{symbol}/risk", post(api::post_risk))
        .route("/api/instruments/{symbol}/position", post(api::post_position))
        .route("/api/instruments/{symbol}/clock", post(api::post_clock))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any))
        .with_state(state)
}

/// Copy transition records into the in-memory history for the records endpoint
pub async fn record_history(state: Arc<AppState>) {
    let mut rx = state.registry.subscribe();
    loop {
        match rx.recv().await {
            Ok(Notice::Transition(record)) => state.history.write().await.push(record),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("History writer lagged, {} notices dropped", n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn encode(msg: &WsMessage) -> Option<Message> {
    serde_json::to_string(msg).ok().map(|json| Message::Text(json.into()))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.registry.subscribe();

    // Current state first, then the live stream
    let welcome = WsMessage::Connected {
        instruments: state.registry.instruments().await,
    };
    let snapshot = WsMessage::Snapshot {
        outputs: state.registry.snapshots().await,
    };
    for msg in [welcome, snapshot] {
        if let Some(frame) = encode(&msg) {
            if sender.send(frame).await.is_err() {
                return;
            }
        }
    }

    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel::<WsMessage>(16);

    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                notice = rx.recv() => match notice {
                    Ok(notice) => WsMessage::Notice { notice },
                    Err(RecvError::Lagged(n)) => WsMessage::Error {
                        message: format!("{} notices dropped", n),
                    },
                    Err(RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let Some(frame) = encode(&msg) else { continue };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let state_clone = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else {
                continue;
            };
            let reply = match client_msg.action.as_str() {
                "snapshot" => {
                    let outputs = match client_msg.instrument.as_deref() {
                        Some(symbol) => state_clone.registry.snapshot(symbol).await.into_iter().collect(),
                        None => state_clone.registry.snapshots().await,
                    };
                    WsMessage::Snapshot { outputs }
                }
                other => WsMessage::Error {
                    message: format!("unknown action: {}", other),
                },
            };
            if reply_tx.send(reply).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("WebSocket client disconnected");
}
