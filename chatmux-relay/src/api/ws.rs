//! `/ws/chat` viewer socket
//!
//! The viewer is subscribed to the hub before history is read, so nothing
//! published in between is lost; a message may appear both in history and live.

use crate::api::AppState;
use crate::hub::Payload;
use crate::{Error, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header::ORIGIN, HeaderMap};
use axum::response::Response;
use chatmux_common::config::WebsocketConfig;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Application-level keepalive; clients ignore it
pub const KEEPALIVE: &str = "__keepalive__";

#[derive(Debug, Default, Deserialize)]
pub struct ChatQuery {
    /// Only forward messages from this platform (case-insensitive)
    pub source: Option<String>,
}

/// GET /ws/chat
pub async fn chat_socket(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());
    if !origin_allowed(&state.config.server.allowed_origins, origin) {
        warn!(origin = origin.unwrap_or_default(), "Rejected chat socket from disallowed origin");
        return Err(Error::Forbidden(format!(
            "origin '{}' is not allowed",
            origin.unwrap_or_default()
        )));
    }

    let filter = query
        .source
        .map(|source| source.trim().to_string())
        .filter(|source| !source.is_empty());
    let max_message_bytes = state.config.websocket.max_message_bytes;

    Ok(ws
        .max_message_size(max_message_bytes)
        .on_upgrade(move |socket| serve_viewer(socket, state, filter)))
}

/// Empty allow-list or `*` admits everyone; requests without an Origin header
/// (non-browser clients) are admitted too
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() || allowed.iter().any(|entry| entry == "*") {
        return true;
    }
    let Some(origin) = origin else {
        return true;
    };
    let origin = origin.trim_end_matches('/');
    allowed
        .iter()
        .any(|entry| entry.trim_end_matches('/').eq_ignore_ascii_case(origin))
}

/// Text frame for one payload
pub fn wire_frame(payload: &str, envelope: bool) -> String {
    if envelope {
        json!({ "type": "chat", "data": payload }).to_string()
    } else {
        payload.to_string()
    }
}

/// `true` when `payload` passes the optional platform filter
pub fn matches_source(payload: &str, filter: Option<&str>) -> bool {
    #[derive(Deserialize)]
    struct SourceField {
        #[serde(default)]
        source: String,
    }

    let Some(filter) = filter else {
        return true;
    };
    serde_json::from_str::<SourceField>(payload)
        .map(|p| p.source.eq_ignore_ascii_case(filter))
        .unwrap_or(false)
}

async fn serve_viewer(socket: WebSocket, state: AppState, filter: Option<String>) {
    let hub = state.relay.hub().clone();
    let settings = state.config.websocket.clone();
    let mut subscription = hub.subscribe();
    let id = subscription.id();
    info!(subscriber = %id, filter = filter.as_deref().unwrap_or("*"), "Chat viewer connected");

    let history = match state.relay.history(settings.history_limit).await {
        Ok(history) => history,
        Err(e) => {
            warn!(subscriber = %id, error = %e, "Failed to load chat history");
            Vec::new()
        }
    };

    let (mut sink, mut stream) = socket.split();
    let writer = async {
        let filter = filter.as_deref();
        for payload in history {
            if !forward(&mut sink, &payload, filter, &settings).await {
                return;
            }
        }

        let ping_every = settings.ping_interval();
        let mut ticker = interval_at(Instant::now() + ping_every, ping_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => {
                    let _ = send(&mut sink, Message::Close(None), settings.write_deadline()).await;
                    return;
                }
                payload = subscription.recv() => match payload {
                    Some(payload) => {
                        if !forward(&mut sink, &payload, filter, &settings).await {
                            return;
                        }
                    }
                    None => {
                        let _ = send(&mut sink, Message::Close(None), settings.write_deadline()).await;
                        return;
                    }
                },
                _ = ticker.tick() => {
                    let deadline = settings.write_deadline();
                    if !send(&mut sink, Message::Text(KEEPALIVE.to_string()), deadline).await
                        || !send(&mut sink, Message::Ping(Vec::new()), deadline).await
                    {
                        return;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = read_until_stalled(&mut stream, settings.pong_wait()) => {}
        _ = writer => {}
    }

    hub.unsubscribe(id);
    info!(subscriber = %id, "Chat viewer disconnected");
}

/// Drain client frames; returns on close, error, or silence longer than `pong_wait`
async fn read_until_stalled(stream: &mut SplitStream<WebSocket>, pong_wait: Duration) {
    loop {
        match timeout(pong_wait, stream.next()).await {
            Err(_) => {
                debug!("Viewer read stalled past pong wait");
                return;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Viewer read failed");
                return;
            }
            // Pongs and anything else the viewer sends just prove liveness
            Ok(Some(Ok(_))) => {}
        }
    }
}

async fn forward(
    sink: &mut SplitSink<WebSocket, Message>,
    payload: &Payload,
    filter: Option<&str>,
    settings: &WebsocketConfig,
) -> bool {
    if !matches_source(payload, filter) {
        return true;
    }
    let frame = wire_frame(payload, settings.envelope);
    send(sink, Message::Text(frame), settings.write_deadline()).await
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, message: Message, deadline: Duration) -> bool {
    match timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "Viewer write failed");
            false
        }
        Err(_) => {
            debug!("Viewer write exceeded deadline");
            false
        }
    }
}
