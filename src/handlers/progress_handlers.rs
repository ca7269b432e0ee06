//! Progress WebSocket handler.
//!
//! `GET /ws` streams every progress event; `GET /ws?fileID=<id>` only those of
//! one object. Messages from the client other than pings and closes are
//! ignored.

use crate::services::{StoreService, progress::Subscription};
use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Query parameters for the progress socket.
#[derive(Debug, Default, Deserialize)]
pub struct ProgressQuery {
    /// Only deliver events for this object.
    #[serde(rename = "fileID")]
    pub file_id: Option<String>,
}

/// `GET /ws`
pub async fn progress_ws(
    ws: WebSocketUpgrade,
    State(service): State<StoreService>,
    Query(query): Query<ProgressQuery>,
) -> Response {
    let hub = Arc::clone(service.progress());
    let subscription = match query.file_id.as_deref() {
        Some(file_id) if !file_id.is_empty() => hub.subscribe(file_id),
        _ => hub.subscribe_all(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, service, subscription, query.file_id))
}

async fn handle_socket(
    socket: WebSocket,
    service: StoreService,
    mut subscription: Subscription,
    file_id: Option<String>,
) {
    debug!(file_id = ?file_id, "progress socket opened");
    let hub = Arc::clone(service.progress());
    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "could not encode progress event");
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = hub.closed() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    debug!(file_id = ?file_id, "progress socket closed");
}
