//! Real-time event gateway: clients bootstrap state via REST, then
//! open a WebSocket and send `{"subscribe": {"topics": [...]}}` frames
//! to receive `{topic, kind, payload, ts}` event frames as they happen.
//!
//! No replay buffer — matches the hub's no-late-joiner-replay contract
//! (see `hub.rs`): anything published before a topic is subscribed to
//! is simply missed.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::state::AppState;
use crate::hub::EventHub;
use crate::model::{ExperimentEvent, ExperimentId};

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub.clone()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { topics: Vec<String> },
}

#[derive(Debug, Serialize)]
struct EventFrame {
    topic: String,
    kind: String,
    payload: ExperimentEvent,
    ts: chrono::DateTime<chrono::Utc>,
}

/// Accepts either a raw hub topic or a bare experiment id for convenience.
fn normalize_topic(topic: String) -> String {
    match topic.parse::<ExperimentId>() {
        Ok(id) => EventHub::topic_for(&id),
        Err(_) => topic,
    }
}

async fn handle_socket(socket: WebSocket, hub: std::sync::Arc<EventHub>) {
    let (mut sink, mut stream) = socket.split();

    // First client frame selects the topics; every matching hub
    // subscription forwards into one shared channel the write loop
    // below drains, so the client sees a single merged event stream.
    let (tx, mut rx) = mpsc::channel::<EventFrame>(256);
    let mut subscriptions = Vec::new();

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(ClientFrame::Subscribe { topics }) = serde_json::from_str::<ClientFrame>(&text)
        else {
            continue;
        };
        for raw_topic in topics {
            let topic = normalize_topic(raw_topic);
            let mut sub = hub.subscribe(topic.clone());
            let forward_tx = tx.clone();
            let forward_topic = topic.clone();
            let task = tokio::spawn(async move {
                while let Some(event) = sub.rx.recv().await {
                    let frame = EventFrame {
                        topic: forward_topic.clone(),
                        kind: event.kind.to_string(),
                        ts: event.created_at,
                        payload: event,
                    };
                    if forward_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });
            subscriptions.push(task);
        }
        break;
    }
    drop(tx);

    if subscriptions.is_empty() {
        let _ = sink.close().await;
        return;
    }

    while let Some(frame) = rx.recv().await {
        let Ok(text) = serde_json::to_string(&frame) else {
            continue;
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }

    for task in subscriptions {
        task.abort();
    }
}
