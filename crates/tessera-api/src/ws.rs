// WebSocket streaming channel
//
// `WS /ws?token=...`: after the client's first `{"type":"auth"}` message the
// channel streams `{type, workflow_id, data, timestamp, sequence}` envelopes
// for the authenticated principal. Delivery is at-least-once: missed entries
// are replayed from the inbox on (re)connect and the per-principal sequence
// lets clients deduplicate. The server pings every 30 seconds and closes the
// connection when the client stays silent past 60 seconds.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tessera_durable::persistence::{InboxKind, InboxSignal};
use tracing::{debug, warn};

use crate::auth::verify_token;
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_SILENCE_LIMIT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct ClientHello {
    #[serde(rename = "type")]
    kind: String,
    /// Highest sequence the client has already seen.
    #[serde(default)]
    last_sequence: i64,
}

pub fn routes(state: AppState) -> Router {
    Router::new().route("/ws", get(upgrade)).with_state(state)
}

async fn upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, params.token, socket))
}

fn envelope(signal: &InboxSignal) -> String {
    let kind = match signal.kind {
        InboxKind::Status => "status",
        InboxKind::Progress => "progress",
        InboxKind::Completion => "completion",
        InboxKind::Error => "error",
    };

    json!({
        "type": kind,
        "workflow_id": signal.workflow_id,
        "data": signal.payload,
        "timestamp": signal.created_at,
        "sequence": signal.sequence,
    })
    .to_string()
}

async fn handle_socket(state: AppState, token: String, mut socket: WebSocket) {
    // The first frame must be the auth hello.
    let hello = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientHello>(&text) {
            Ok(hello) if hello.kind == "auth" => hello,
            _ => {
                let _ = socket
                    .send(Message::Text(
                        json!({"type": "error", "detail": "expected auth message"}).to_string(),
                    ))
                    .await;
                return;
            }
        },
        _ => return,
    };

    let Some(principal) = verify_token(&token) else {
        let _ = socket
            .send(Message::Text(
                json!({"type": "error", "detail": "invalid token"}).to_string(),
            ))
            .await;
        return;
    };

    debug!(principal = %principal.subject, "websocket authenticated");

    // Live subscription first, then backlog: anything published in between
    // is deduplicated client-side by sequence.
    let mut live = state.fanout.subscribe(&principal.subject);

    let mut last_sent = hello.last_sequence;
    match state.fanout.catch_up(&principal.subject, last_sent).await {
        Ok(missed) => {
            for signal in missed {
                last_sent = last_sent.max(signal.sequence);
                if socket.send(Message::Text(envelope(&signal))).await.is_err() {
                    return;
                }
            }
        }
        Err(e) => {
            warn!("inbox catch-up failed: {e}");
        }
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // first tick is immediate
    let mut last_heard = tokio::time::Instant::now();

    loop {
        tokio::select! {
            incoming = live.recv() => {
                match incoming {
                    Ok(signal) => {
                        if signal.sequence <= last_sent {
                            continue;
                        }
                        last_sent = signal.sequence;
                        if socket.send(Message::Text(envelope(&signal))).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // The durable inbox fills the gap.
                        debug!(skipped, "subscriber lagged; replaying from inbox");
                        if let Ok(missed) = state.fanout.catch_up(&principal.subject, last_sent).await {
                            for signal in missed {
                                last_sent = last_sent.max(signal.sequence);
                                if socket.send(Message::Text(envelope(&signal))).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = ping.tick() => {
                if last_heard.elapsed() > CLIENT_SILENCE_LIMIT {
                    debug!(principal = %principal.subject, "client silent; closing websocket");
                    break;
                }
                if socket.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }

            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        last_heard = tokio::time::Instant::now();
                    }
                    Some(Err(e)) => {
                        debug!("websocket receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    debug!(principal = %principal.subject, "websocket closed");
}
