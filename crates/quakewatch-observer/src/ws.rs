//! `WebSocket` session endpoint.
//!
//! Clients connect to `GET /session`. Each socket gets a
//! [`Session`](quakewatch_core::Session) from the engine; one task per
//! socket forwards the session's queued frames to the client and feeds
//! inbound text frames back to the engine, so writes to a socket are never
//! interleaved.
//!
//! Any request to the endpoint that is not a `WebSocket` upgrade, whatever
//! its method, is answered with `426 Upgrade Required`.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::debug;

use crate::error::ObserverError;
use crate::state::AppState;

/// Header set by the Cloudflare edge with the original client address.
const CONNECTING_IP: &str = "cf-connecting-ip";
const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_CLIENT: &str = "unknown";

/// Upgrade to a subscriber session.
///
/// # Route
///
/// `/session` (any method)
pub async fn session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = ws else {
        return ObserverError::UpgradeRequired.into_response();
    };
    let client = client_identifier(&headers);
    ws.on_upgrade(move |socket| handle_session(socket, state, client))
}

/// Identify the client for unique-connection counting.
pub fn client_identifier(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    header(CONNECTING_IP)
        .or_else(|| {
            header(FORWARDED_FOR)
                .and_then(|list| list.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
        .unwrap_or(UNKNOWN_CLIENT)
        .to_owned()
}

/// Pump frames between the socket and the engine until either side
/// goes away.
async fn handle_session(mut socket: WebSocket, state: Arc<AppState>, client: String) {
    let engine = &state.engine;
    let (session, mut outbound) = engine.connect(&client);
    debug!(session_id = %session.id(), client, "WebSocket session started");

    loop {
        tokio::select! {
            // Forward queued frames to the client.
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    debug!(session_id = %session.id(), "WebSocket send failed");
                    break;
                }
            }
            // Handle whatever the client sent.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        engine.handle_inbound(&session, text.as_str(), Utc::now()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = %session.id(), "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(session_id = %session.id(), error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Protocol pings are answered by axum; binary is ignored.
                        session.touch(Utc::now());
                    }
                }
            }
        }
        if !session.is_open() {
            break;
        }
    }

    engine.disconnect(&session);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn connecting_ip_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTING_IP, HeaderValue::from_static("203.0.113.7"));
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_identifier(&headers), "203.0.113.7");
    }

    #[test]
    fn first_forwarded_address_is_used() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static(" 198.51.100.1 , 10.0.0.1"),
        );
        assert_eq!(client_identifier(&headers), "198.51.100.1");
    }

    #[test]
    fn missing_headers_are_unknown() {
        assert_eq!(client_identifier(&HeaderMap::new()), "unknown");
    }
}
