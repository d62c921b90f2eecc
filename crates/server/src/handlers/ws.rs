//! The live connection.
//!
//! A client upgrades to a WebSocket with its bearer token, gets bound
//! into the session registry (evicting any prior connection for the same
//! identity), and from then on receives server events through a dedicated
//! writer task while its inbound events are dispatched here. Disconnect
//! unwinds the binding, sweeps typing timers, and broadcasts offline.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::AppState;
use crate::delivery;
use crate::error::{Error, Result};
use crate::models::{ClientEvent, MessageKind};
use crate::registry::Outbound;
use crate::store::NewMessage;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws?token=... (token also accepted as a bearer header)
pub async fn ws_connect(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: axum::http::HeaderMap,
    State(state): State<AppState>,
) -> Result<Response> {
    let token = query
        .token
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)?
                .to_str()
                .ok()?
                .strip_prefix("Bearer ")
                .map(str::to_string)
        })
        .ok_or(Error::AuthFailNoToken)?;

    let user = state
        .auth
        .validate_session(&token)
        .await
        .map_err(|_| Error::LoginFail)?;

    Ok(ws.on_upgrade(move |socket| client_session(state, user.id, socket)))
}

/// Bind a fresh connection for an identity and announce it online.
/// Last connection wins: any prior session is signalled with a close
/// frame and evicted. Returns the new connection id.
pub fn open_session(
    state: &AppState,
    user_id: &str,
    tx: tokio::sync::mpsc::UnboundedSender<Outbound>,
) -> u64 {
    let conn = state.registry.new_connection(tx);
    let conn_id = conn.id();
    if let Some(evicted) = state.registry.bind(user_id, conn) {
        evicted.close();
    }
    state.presence.announce(user_id, true);
    conn_id
}

/// Unwind a disconnecting session: unbind by connection id, cancel the
/// identity's typing timers on both sides of every pair, and announce
/// offline. A stale id (the connection was already evicted by a
/// replacement) unwinds nothing.
pub fn close_session(state: &AppState, user_id: &str, conn_id: u64) {
    if state.registry.unbind(conn_id).is_some() {
        state.typing.disconnect(user_id);
        state.presence.announce(user_id, false);
        info!("[WS] Disconnected: {}", user_id);
    } else {
        debug!("[WS] Closed evicted connection for {}", user_id);
    }
}

async fn client_session(state: AppState, user_id: String, socket: WebSocket) {
    info!("[WS] Connected: {}", user_id);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn_id = open_session(&state, &user_id, tx);

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Event(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("[WS] Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(frame)) = ws_rx.next().await {
        match frame {
            WsMessage::Text(text) => {
                if let Err(e) = dispatch(&state, &user_id, &text).await {
                    warn!("[WS] Event from {} failed: {:?}", user_id, e);
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    close_session(&state, &user_id, conn_id);
    writer.abort();
}

async fn dispatch(state: &AppState, user_id: &str, text: &str) -> Result<()> {
    let event: ClientEvent = serde_json::from_str(text)
        .map_err(|e| Error::BadRequest(format!("Unparseable client event: {}", e)))?;

    match event {
        ClientEvent::Send { receiver_id, text } => {
            delivery::send_message(
                state,
                user_id,
                NewMessage {
                    sender_id: user_id.to_string(),
                    receiver_id: receiver_id.clone(),
                    text: Some(text),
                    attachment: None,
                    kind: MessageKind::Text,
                    duration_secs: None,
                },
            )
            .await?;
            // A send implies composing ended.
            state.typing.stop(user_id, &receiver_id);
        }
        ClientEvent::Edit { message_id, text } => {
            delivery::edit_message(state, user_id, &message_id, &text).await?;
        }
        ClientEvent::Delete { message_id } => {
            delivery::delete_message(state, user_id, &message_id).await?;
        }
        ClientEvent::TypingStart { receiver_id } => {
            state.typing.keystroke(user_id, &receiver_id);
        }
        ClientEvent::TypingStop { receiver_id } => {
            state.typing.stop(user_id, &receiver_id);
        }
        ClientEvent::OpenConversation { user_id: other } => {
            state.registry.set_viewing(user_id, Some(&other));
            delivery::mark_conversation_read(state, user_id, &other).await?;
        }
        ClientEvent::CloseConversation => {
            state.registry.set_viewing(user_id, None);
        }
    }

    Ok(())
}
