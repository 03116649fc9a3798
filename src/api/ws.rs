//! WebSocket event stream.
//!
//! Every connected client gets every event published on the bus as tagged
//! JSON. A client that falls behind the broadcast ring is told how many
//! events it missed and keeps streaming from the oldest retained one.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::AppState;
use crate::events::EventBus;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Event stream client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.events))
}

async fn handle_socket(mut socket: WebSocket, events: EventBus) {
    let mut rx = events.subscribe();
    info!(subscribers = events.subscriber_count(), "Event stream client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                let frame = match result {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, kind = event.kind(), "Failed to serialize event");
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Event stream client lagged behind broadcast");
                        serde_json::json!({"type": "lagged", "missed": missed}).to_string()
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed");
                        break;
                    }
                };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    debug!("Client disconnected during send");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event stream client disconnected");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(text = %text.as_str(), "Ignoring client message on event stream");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Event stream connection closed");
}
