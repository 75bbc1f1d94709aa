//! Signaling WebSocket at `/ws`
//!
//! Each socket drives one [`ClientSession`]. The connection type is checked
//! before the upgrade, so an unsupported transport never reaches the
//! registry.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::signaling::{ClientHandle, ClientMessage, ClientSession, ConnectionType, ServerMessage};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    #[serde(default = "default_connection_type")]
    pub connection_type: String,
}

fn default_connection_type() -> String {
    "websocket".to_string()
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response> {
    ConnectionType::from_str(&query.connection_type)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, query.connection_type)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, connection_type: String) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = ClientHandle::channel();

    let config = state.config.get();
    let mut session = ClientSession::new(
        state.registry.clone(),
        state.events.clone(),
        handle.clone(),
        connection_type,
        config.signaling.enforce_membership,
    );

    info!("Signaling client {} connected", handle.id());

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(config.signaling.heartbeat_secs.max(1)));
    let mut shutdown = state.shutdown_signal();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => session.handle_message(msg).await,
                            Err(e) => {
                                warn!("Malformed message from client {}: {}", handle.id(), e);
                                let _ = handle.send(ServerMessage::error(format!("Malformed message: {}", e)));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        debug!("Received ping from client {}", handle.id());
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Received pong from client {}", handle.id());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling client {} disconnected", handle.id());
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            warn!("Failed to send to client {}, disconnecting", handle.id());
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode server message: {}", e),
                }
            }

            // Registration replaced by a newer transport
            _ = handle.closed() => {
                info!("Signaling client {} superseded, closing", handle.id());
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            _ = shutdown.recv() => {
                info!("Server shutting down, closing signaling client {}", handle.id());
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }

    session.close().await;
    debug!("Signaling handler for {} exiting", handle.id());
}
