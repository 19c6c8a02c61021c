//! WebSocket channel subscriptions (`GET /api/ws`), bridging
//! `relay_core::events::EventBus` onto a single socket per spec.md §4.8/§6: the
//! first client message selects channels, after which events flow one-way.
//!
//! Grounded on `dwctl`'s websocket-by-subscription handlers: upgrade first, wait
//! for the subscribe frame, then forward from an `mpsc::Receiver` until the bus
//! disconnects the slow consumer or the client goes away.

use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response as AxumResponse;
use relay_core::events::Channel;
use serde::Deserialize;

use super::AppState;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channels: Vec<Channel> },
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> AxumResponse {
    ws.on_upgrade(move |socket| handle(socket, state))
}

async fn handle(mut socket: WebSocket, state: AppState) {
    let channels = match tokio::time::timeout(Duration::from_secs(10), socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Subscribe { channels }) => channels.into_iter().collect::<HashSet<_>>(),
            Err(_) => {
                let _ = socket.send(Message::Text(r#"{"error":"expected a subscribe message"}"#.into())).await;
                return;
            }
        },
        _ => return,
    };

    let (subscriber_id, mut rx) = state.gateway.subscribe(channels);
    while let Some(event) = rx.recv().await {
        let Ok(text) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    state.gateway.bus.unsubscribe(subscriber_id);
}
