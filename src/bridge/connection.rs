//! One receive-only connection of an agent context

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peer::{ConnectionState, InboundTrack, MediaKind, MediaPeer};
use super::sink::MediaSink;
use crate::signaling::StreamType;

/// Identity of a connection within a context: remote peer and stream type
///
/// Displays as `peer-stream`. Lookups by peer compare the `peer_id` field,
/// so ids that share a prefix never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub peer_id: String,
    pub stream_type: StreamType,
}

impl ConnectionKey {
    pub fn new(peer_id: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            peer_id: peer_id.into(),
            stream_type,
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.peer_id, self.stream_type)
    }
}

/// Lifecycle of a bridge connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Created,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

pub struct BridgeConnection {
    key: ConnectionKey,
    kind: MediaKind,
    peer: Arc<dyn MediaPeer>,
    sink: Mutex<Option<Box<dyn MediaSink>>>,
    phase: RwLock<ConnectionPhase>,
    state: RwLock<ConnectionState>,
    monitoring: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl BridgeConnection {
    pub fn new(key: ConnectionKey, peer: Arc<dyn MediaPeer>, cancel: CancellationToken) -> Self {
        let kind = MediaKind::for_stream(key.stream_type);
        Self {
            key,
            kind,
            peer,
            sink: Mutex::new(None),
            phase: RwLock::new(ConnectionPhase::Created),
            state: RwLock::new(ConnectionState::New),
            monitoring: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn peer(&self) -> &Arc<dyn MediaPeer> {
        &self.peer
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.read()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Relaxed)
    }

    pub fn set_monitoring(&self, monitoring: bool) {
        self.monitoring.store(monitoring, Ordering::Relaxed);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to `phase` unless the connection is already closed
    pub fn set_phase(&self, phase: ConnectionPhase) {
        if self.is_closed() {
            return;
        }
        *self.phase.write() = phase;
    }

    /// Record a transport state change and derive the phase from it
    pub fn on_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        match state {
            ConnectionState::Connected => self.set_phase(ConnectionPhase::Connected),
            ConnectionState::Failed => self.set_phase(ConnectionPhase::Failed),
            _ => {}
        }
    }

    /// Whether an inbound track matches this connection's transceiver
    pub fn accepts_track(&self, track: &InboundTrack) -> bool {
        if track.kind != self.kind {
            warn!(
                "Dropping {} track on {} connection {}",
                track.kind, self.kind, self.key
            );
            return false;
        }
        true
    }

    /// Install the sink; a sink arriving after close is stopped at once
    pub fn attach_sink(&self, sink: Box<dyn MediaSink>) {
        if self.is_closed() {
            let _ = sink.stop();
            return;
        }
        if let Some(old) = self.sink.lock().replace(sink) {
            let _ = old.stop();
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Stop the sink and close the peer; only the first call has effect
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        *self.phase.write() = ConnectionPhase::Closed;

        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            if let Err(e) = sink.stop() {
                debug!("Sink stop on {} failed: {}", self.key, e);
            }
        }

        if let Err(e) = self.peer.close().await {
            warn!("Closing {} failed: {}", self.key, e);
        }
        *self.state.write() = ConnectionState::Closed;
        info!("Connection {} closed", self.key);
    }
}
