use axum::{
    extract::{
        ws::{Message as WsAxumMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use letschat_protocol::{error_codes, Message, Operation, WsFrame};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::validate_token;
use crate::repo::messages;
use crate::state::AppState;
use crate::ws_common::{
    recv_text_with_timeout, send_heartbeat, send_invalid_token_error, send_ws_error,
};

/// Server -> client heartbeat interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Read deadline: a connection that goes this long without a frame is dead.
const READ_TIMEOUT: Duration = HEARTBEAT_INTERVAL.saturating_mul(3);

pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = crate::ws_common::extract_token_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, token))
}

async fn handle_chat_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let token_str = match token {
        Some(t) => t,
        None => {
            send_invalid_token_error(&mut socket, "missing Authorization header").await;
            return;
        }
    };
    let claims = match validate_token(&state.pool, &token_str).await {
        Some(c) => c,
        None => {
            send_invalid_token_error(&mut socket, "unknown or revoked token").await;
            return;
        }
    };
    let user_id = claims.user_id;
    let session_id = Uuid::new_v4().to_string();
    let mut mailbox = state.hub.attach(user_id).await;
    info!(%user_id, session_id = %session_id, "chat session started");

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_interval.tick().await;

    loop {
        tokio::select! {
            frame = mailbox.rx.recv() => {
                match frame {
                    Some(msg) => {
                        if !send_message_frame(&mut socket, msg).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut mailbox.close_slow => {
                warn!(%user_id, "mailbox overflowed, closing connection");
                break;
            }
            _ = heartbeat_interval.tick() => {
                if !send_heartbeat(&mut socket, &session_id).await {
                    break;
                }
            }
            text = recv_text_with_timeout(&mut socket, READ_TIMEOUT) => {
                match text {
                    Ok(text) => {
                        if !handle_incoming_text(&mut socket, &state, user_id, &text).await {
                            break;
                        }
                    }
                    Err(()) => break,
                }
            }
        }
    }

    state.hub.detach(user_id).await;
    info!(%user_id, session_id = %session_id, "chat session ended");
}

async fn send_message_frame(socket: &mut WebSocket, msg: Message) -> bool {
    let frame = WsFrame::Message(msg);
    match serde_json::to_string(&frame) {
        Ok(json) => socket.send(WsAxumMessage::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

/// Returns `false` if the connection should be torn down.
async fn handle_incoming_text(
    socket: &mut WebSocket,
    state: &AppState,
    user_id: Uuid,
    text: &str,
) -> bool {
    let frame: WsFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            send_ws_error(
                socket,
                error_codes::PROTOCOL_ERROR,
                &format!("invalid JSON: {e}"),
                false,
            )
            .await;
            return true;
        }
    };

    let msg = match frame {
        WsFrame::Message(m) => m,
        WsFrame::Heartbeat(_) => return true,
        WsFrame::Error(_) => return true,
    };

    if msg.sender_id != user_id {
        send_ws_error(
            socket,
            error_codes::PROTOCOL_ERROR,
            "senderID does not match authenticated user",
            false,
        )
        .await;
        return true;
    }

    match msg.operation {
        Operation::UserOnline | Operation::UserOffline => {
            send_ws_error(
                socket,
                error_codes::PROTOCOL_ERROR,
                "presence frames are server-generated only",
                false,
            )
            .await;
            return true;
        }
        Operation::Local => {
            send_ws_error(
                socket,
                error_codes::PROTOCOL_ERROR,
                "operation not valid on the wire",
                false,
            )
            .await;
            return true;
        }
        _ => {}
    }

    if let Err(e) = msg.validate() {
        let details = serde_json::json!({ "errors": e.0 });
        send_ws_error(
            socket,
            error_codes::VALIDATION,
            &details.to_string(),
            false,
        )
        .await;
        return true;
    }

    if msg.operation != Operation::UserTyping {
        if let Err(e) = messages::upsert(&state.pool, &msg).await {
            warn!(id = %msg.id, error = %e, "failed to persist message");
            send_ws_error(socket, error_codes::INTERNAL_ERROR, "persistence failure", true).await;
            return true;
        }
    }

    state.hub.route(msg).await;
    true
}
