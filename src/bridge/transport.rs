//! Signaling transports used by agent contexts
//!
//! An agent talks to the relay either in-process ([`LocalConnector`]) or
//! over a WebSocket to a remote relay ([`WsConnector`]). Both yield the same
//! [`SignalingChannel`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::events::EventBus;
use crate::signaling::{ClientHandle, ClientMessage, ClientSession, ServerMessage, SpaceRegistry};

/// One open signaling transport
///
/// Cancelling `closer` closes the transport; it is also cancelled when the
/// remote side goes away.
pub struct SignalingChannel {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
    pub closer: CancellationToken,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingChannel>;
}

/// In-process transport driving a [`ClientSession`] on the local registry
pub struct LocalConnector {
    registry: Arc<SpaceRegistry>,
    events: Arc<EventBus>,
    enforce_membership: bool,
}

impl LocalConnector {
    pub fn new(registry: Arc<SpaceRegistry>, events: Arc<EventBus>, enforce_membership: bool) -> Self {
        Self {
            registry,
            events,
            enforce_membership,
        }
    }

    pub fn registry(&self) -> &Arc<SpaceRegistry> {
        &self.registry
    }
}

#[async_trait]
impl SignalingConnector for LocalConnector {
    async fn connect(&self) -> Result<SignalingChannel> {
        let (handle, inbound) = ClientHandle::channel();
        let (outbound, mut requests) = mpsc::unbounded_channel::<ClientMessage>();
        let closer = CancellationToken::new();

        let mut session = ClientSession::new(
            self.registry.clone(),
            self.events.clone(),
            handle.clone(),
            "local",
            self.enforce_membership,
        );
        let token = closer.clone();
        tokio::spawn(async move {
            loop {
                // Queued requests (a final leave) are handled before closing
                tokio::select! {
                    biased;
                    msg = requests.recv() => match msg {
                        Some(msg) => session.handle_message(msg).await,
                        None => break,
                    },
                    _ = token.cancelled() => break,
                    _ = handle.closed() => {
                        debug!("Local connection {} replaced", handle.id());
                        break;
                    }
                }
            }
            session.close().await;
            token.cancel();
            debug!("Local connection {} closed", handle.id());
        });

        Ok(SignalingChannel {
            outbound,
            inbound,
            closer,
        })
    }
}

/// WebSocket transport to a remote relay
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> String {
        with_connection_type(&self.url)
    }
}

/// Append the websocket connection type unless the URL already names one
fn with_connection_type(url: &str) -> String {
    if url.contains("connectionType=") {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&connectionType=websocket", url)
    } else {
        format!("{}?connectionType=websocket", url)
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self) -> Result<SignalingChannel> {
        let url = self.url();
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| AppError::Transport(format!("Failed to connect to {}: {}", url, e)))?;
        info!("Connected to signaling relay {}", url);

        let (mut sink, mut source) = stream.split();
        let (outbound, mut requests) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let closer = CancellationToken::new();

        let token = closer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = requests.recv() => {
                        let Some(msg) = msg else { break };
                        let text = match serde_json::to_string(&msg) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode signaling message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!("Signaling send failed: {}", e);
                            break;
                        }
                    }
                    _ = token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            token.cancel();
        });

        let token = closer.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = source.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                if inbound_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Unparseable relay message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling relay closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Signaling receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            token.cancel();
        });

        Ok(SignalingChannel {
            outbound,
            inbound,
            closer,
        })
    }
}
