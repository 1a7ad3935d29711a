use crate::auth::extract_bearer;
use axum::{
    extract::ws::{Message as WsAxumMessage, WebSocket},
    http::HeaderMap,
};
use letschat_protocol::{error_codes, ErrorMessage, Heartbeat, WsFrame};
use std::time::Duration;

pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned)
}

fn error_json(code: &str, message: &str, retryable: bool) -> Option<String> {
    serde_json::to_string(&WsFrame::Error(ErrorMessage {
        code: code.to_owned(),
        message: message.to_owned(),
        retryable,
    }))
    .ok()
}

pub async fn send_ws_error(socket: &mut WebSocket, code: &str, message: &str, retryable: bool) {
    if let Some(json) = error_json(code, message, retryable) {
        let _ = socket.send(WsAxumMessage::Text(json.into())).await;
    }
}

pub async fn send_invalid_token_error(socket: &mut WebSocket, message: &str) {
    send_ws_error(socket, error_codes::INVALID_TOKEN, message, false).await;
}

fn heartbeat_json(session_id: &str) -> Option<String> {
    serde_json::to_string(&WsFrame::Heartbeat(Heartbeat {
        session_id: session_id.to_owned(),
    }))
    .ok()
}

pub async fn send_heartbeat(socket: &mut WebSocket, session_id: &str) -> bool {
    match heartbeat_json(session_id) {
        Some(json) => socket.send(WsAxumMessage::Text(json.into())).await.is_ok(),
        None => true,
    }
}

pub async fn recv_text_with_timeout(
    socket: &mut WebSocket,
    timeout: Duration,
) -> Result<String, ()> {
    match tokio::time::timeout(timeout, socket.recv()).await {
        Ok(Some(Ok(WsAxumMessage::Text(text)))) => Ok(text.to_string()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_token_from_headers_handles_missing_malformed_and_valid_bearer() {
        let missing = HeaderMap::new();
        assert_eq!(extract_token_from_headers(&missing), None);

        let mut malformed = HeaderMap::new();
        malformed.insert(
            "authorization",
            axum::http::HeaderValue::from_static("Basic abc123"),
        );
        assert_eq!(extract_token_from_headers(&malformed), None);

        let mut valid = HeaderMap::new();
        valid.insert(
            "authorization",
            axum::http::HeaderValue::from_static("Bearer token-123"),
        );
        assert_eq!(
            extract_token_from_headers(&valid),
            Some("token-123".to_owned())
        );
    }

    #[test]
    fn send_ws_error_payload_serialization_matches_contract() {
        let text = error_json("PROTOCOL_ERROR", "bad frame", false)
            .expect("error payload should serialize");
        let frame: WsFrame = serde_json::from_str(&text).expect("error payload should parse");
        assert_eq!(
            frame,
            WsFrame::Error(ErrorMessage {
                code: "PROTOCOL_ERROR".to_owned(),
                message: "bad frame".to_owned(),
                retryable: false,
            })
        );
    }

    #[test]
    fn heartbeat_payload_serialization_matches_contract() {
        let text = heartbeat_json("session-1").expect("heartbeat payload should serialize");
        let frame: WsFrame = serde_json::from_str(&text).expect("heartbeat payload should parse");
        assert_eq!(
            frame,
            WsFrame::Heartbeat(Heartbeat {
                session_id: "session-1".to_owned(),
            })
        );
    }
}
