//! Terminal proxy (`GET /ship/{id}/term`, §4.3/§6). Upgrades the inbound
//! connection, opens a second WebSocket to the Ship's own `/term` endpoint,
//! and forwards frames byte-for-byte in both directions: upgrade in one
//! function, the bidirectional `tokio::select!` loop in another.
//!
//! A browser's native `WebSocket` can't set an `Authorization` or
//! `X-SESSION-ID` header, so unlike the rest of the façade this route sits
//! outside `auth_middleware` and authenticates from its own query string
//! instead: `?token=...&session_id=...&cols=...&rows=...`.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use super::auth::tokens_match;
use super::GatewayState;

const CLOSE_AUTH: u16 = 4001;
const CLOSE_NO_SESSION: u16 = 4003;
const CLOSE_UNKNOWN_SHIP: u16 = 4004;

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

pub async fn terminal_handler(
    State(state): State<GatewayState>,
    Path(ship_id): Path<String>,
    Query(q): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, ship_id, q))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, ship_id: String, q: TerminalQuery) {
    let Some(token) = q.token.as_deref() else {
        close_with(&mut socket, CLOSE_AUTH, "missing token").await;
        return;
    };
    if !tokens_match(token, &state.config.access_token) {
        close_with(&mut socket, CLOSE_AUTH, "invalid token").await;
        return;
    }

    let Some(session_id) = q.session_id else {
        close_with(&mut socket, CLOSE_NO_SESSION, "missing session_id").await;
        return;
    };

    let ship = match state.ships.get(&ship_id).await {
        Ok(ship) => ship,
        Err(_) => {
            close_with(&mut socket, CLOSE_UNKNOWN_SHIP, "unknown ship").await;
            return;
        }
    };

    let session_row = match state.sessions.get(&session_id).await {
        Ok(row) => row,
        Err(_) => {
            close_with(&mut socket, CLOSE_NO_SESSION, "unknown session").await;
            return;
        }
    };
    if session_row.ship_id != ship_id {
        close_with(&mut socket, CLOSE_AUTH, "session is not bound to this ship").await;
        return;
    }

    let Some(endpoint) = ship.endpoint.clone() else {
        close_with(&mut socket, CLOSE_UNKNOWN_SHIP, "ship has no endpoint").await;
        return;
    };

    let url = crate::ship_client::ShipClient::terminal_ws_url(&endpoint, q.cols, q.rows);
    let upstream = match tokio_tungstenite::connect_async(&url).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::warn!(ship_id, error = %e, "terminal proxy: failed to connect upstream");
            close_with(&mut socket, CLOSE_UNKNOWN_SHIP, "ship terminal unreachable").await;
            return;
        }
    };

    let (mut up_write, mut up_read) = upstream.split();

    // Each iteration reads at most one frame and awaits its forward before
    // reading again, so a slow peer stalls the loop instead of growing an
    // unbounded buffer (§4.3).
    loop {
        tokio::select! {
            client_msg = socket.recv() => {
                match client_msg {
                    Some(Ok(Message::Text(text))) => {
                        if up_write.send(tokio_tungstenite::tungstenite::Message::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bin))) => {
                        if up_write.send(tokio_tungstenite::tungstenite::Message::Binary(bin.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            upstream_msg = up_read.next() => {
                match upstream_msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        if socket.send(Message::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(bin))) => {
                        if socket.send(Message::Binary(bin.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = up_write.close().await;
    let _ = socket.close().await;
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
