//! Relay socket: forwards framed peer traffic between connected peers.

use std::borrow::Cow;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use lanbeam_core::relay::{rewrite_address, ForwardEnvelope};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, Attached, SOCKET_QUEUE};

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    #[serde(rename = "peerId")]
    pub peer_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(q): Query<RelayQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, q.peer_id, state))
}

async fn handle_socket(mut socket: WebSocket, peer_id: Option<String>, state: AppState) {
    let Some(peer_id) = peer_id.filter(|p| !p.is_empty()) else {
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::from("Missing peerId"),
            })))
            .await;
        return;
    };

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(SOCKET_QUEUE);
    let Attached {
        conn_id,
        mut replaced,
    } = state.attach(&peer_id, tx).await;
    info!(event = "relay_connected", peer = %peer_id, "Relay socket connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = &mut replaced => {
                info!(event = "relay_replaced", peer = %peer_id, "Newer relay socket for this peer");
                break;
            }
        };
        match msg {
            Some(Ok(WsMessage::Binary(bytes))) => forward_binary(&state, &peer_id, &bytes).await,
            Some(Ok(WsMessage::Text(text))) => forward_text(&state, &peer_id, &text).await,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(event = "relay_error", peer = %peer_id, error = %e, "Relay socket error");
                break;
            }
        }
    }

    writer.abort();
    let removed = state.detach(&peer_id, conn_id).await;
    info!(event = "relay_disconnected", peer = %peer_id, presence_removed = removed, "Relay socket closed");
}

async fn forward_binary(state: &AppState, sender: &str, bytes: &[u8]) {
    let (target, frame) = match rewrite_address(bytes, sender) {
        Ok(v) => v,
        Err(e) => {
            warn!(event = "bad_frame", peer = %sender, error = %e, "Dropping malformed binary frame");
            return;
        }
    };
    if !state.deliver(&target, WsMessage::Binary(frame)).await {
        debug!(event = "target_offline", from = %sender, to = %target, "Dropped binary frame");
    }
}

async fn forward_text(state: &AppState, sender: &str, text: &str) {
    let env: ForwardEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            warn!(event = "bad_envelope", peer = %sender, error = %e, "Dropping malformed text frame");
            return;
        }
    };
    if !env.is_forward() {
        return;
    }
    let (target, delivered) = env.rebox(sender);
    let body = match serde_json::to_string(&delivered) {
        Ok(b) => b,
        Err(e) => {
            warn!(event = "bad_envelope", peer = %sender, error = %e, "Could not re-encode envelope");
            return;
        }
    };
    if !state.deliver(&target, WsMessage::Text(body)).await {
        debug!(event = "target_offline", from = %sender, to = %target, kind = %delivered.kind, "Dropped text frame");
    }
}
