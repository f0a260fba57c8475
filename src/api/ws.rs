// =============================================================================
// WebSocket Handler — the push channel
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` (or with an Authorization
// bearer header). The token resolves to `(user_id, account_id)`; anything
// else is refused with a 401 before the upgrade.
//
// Per-connection model: one write pump draining the hub-owned bounded queue
// onto the socket, one read pump consuming client frames. The hub never
// touches the socket; closing the queue (unregister) is what ends the write
// pump, and a read error or Close frame ends the session.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::accounts::TokenIdentity;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = query.token.or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(String::from)
    });

    let identity = token.and_then(|t| state.accounts.validate_token(&t));
    let Some(identity) = identity else {
        warn!("push channel rejected: invalid or missing token");
        return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
    };

    info!(user = %identity.user_id, account = %identity.account_id, "push channel accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state, identity))
        .into_response()
}

// =============================================================================
// Connection lifecycle
// =============================================================================

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, identity: TokenIdentity) {
    let (client_id, outbound_rx) = state
        .hub
        .register(&identity.user_id, &identity.account_id);

    let (sender, receiver) = socket.split();

    // Write pump runs as its own task; it ends when the hub closes the queue.
    let writer = tokio::spawn(write_pump(sender, outbound_rx, client_id));

    // Read pump runs here; its exit tears the session down.
    read_pump(receiver, client_id).await;

    state.hub.unregister(client_id);
    let _ = writer.await;
    info!(client = client_id, "push channel closed");
}

/// Drain the hub queue onto the socket until the queue closes or a send
/// fails.
async fn write_pump(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    client_id: u64,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sender.send(Message::Text(frame)).await {
            debug!(client = client_id, error = %e, "write pump send failed");
            break;
        }
    }
    debug!(client = client_id, "write pump finished");
}

/// Consume inbound frames. Text frames are treated as client heartbeats;
/// Close, error, or stream end terminates the pump.
async fn read_pump(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    client_id: u64,
) {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!(client = client_id, msg = %text, "client heartbeat");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // The protocol layer answers pings; nothing to do.
            }
            Ok(Message::Binary(_)) => {
                debug!(client = client_id, "binary frame ignored");
            }
            Ok(Message::Close(_)) => {
                info!(client = client_id, "close frame received");
                return;
            }
            Err(e) => {
                debug!(client = client_id, error = %e, "read pump error");
                return;
            }
        }
    }
}
