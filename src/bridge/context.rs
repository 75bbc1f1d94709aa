//! Agent context: one joined (space, agent) pair
//!
//! The context owns its peer connections and applies the per-stream state
//! machine to every inbound signal. Signals are handled sequentially by the
//! context's dispatcher task, so messages for one connection key are always
//! processed in order.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{BridgeConnection, ConnectionKey, ConnectionPhase};
use super::peer::{ConnectionState, PeerEvent, PeerFactory};
use super::sink::{MediaSample, SinkFactory};
use crate::error::{AppError, Result};
use crate::media::{AudioBatch, RgbaFrame};
use crate::monitor::StreamMonitor;
use crate::signaling::{
    ClientMessage, IceCandidate, LeaveRequest, ParticipantSummary, PublishIntent, Role,
    ServerMessage, SessionDescription, Signal, SignalKind, SignalMessage, StreamType,
};

/// Capabilities shared by every context of a bridge
#[derive(Clone)]
pub struct BridgeDeps {
    pub peers: Arc<dyn PeerFactory>,
    pub sinks: Arc<dyn SinkFactory>,
    pub monitor: Arc<dyn StreamMonitor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Connecting,
    Joined,
    Leaving,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub key: String,
    pub peer_id: String,
    pub stream_type: StreamType,
    pub phase: ConnectionPhase,
    pub state: ConnectionState,
    pub monitoring: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStatus {
    pub space_id: String,
    pub agent_id: String,
    pub state: ContextState,
    pub connections: Vec<ConnectionStatus>,
    pub sessions: Vec<String>,
}

pub struct AgentContext {
    agent_id: String,
    space_id: String,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    transport: CancellationToken,
    connections: RwLock<HashMap<ConnectionKey, Arc<BridgeConnection>>>,
    sessions: Arc<RwLock<HashSet<String>>>,
    roster: RwLock<HashMap<String, ParticipantSummary>>,
    state: RwLock<ContextState>,
    deps: BridgeDeps,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl AgentContext {
    pub fn new(
        agent_id: impl Into<String>,
        space_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        transport: CancellationToken,
        deps: BridgeDeps,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_id: agent_id.into(),
            space_id: space_id.into(),
            outbound,
            transport,
            connections: RwLock::new(HashMap::new()),
            sessions: Arc::new(RwLock::new(HashSet::new())),
            roster: RwLock::new(HashMap::new()),
            state: RwLock::new(ContextState::Connecting),
            deps,
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn state(&self) -> ContextState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ContextState) {
        *self.state.write() = state;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn transport_token(&self) -> &CancellationToken {
        &self.transport
    }

    /// Replace the roster with the participants listed in `joined`
    pub fn set_roster(&self, participants: Vec<ParticipantSummary>) {
        let mut roster = self.roster.write();
        roster.clear();
        for p in participants {
            if p.participant_id != self.agent_id {
                roster.insert(p.participant_id.clone(), p);
            }
        }
    }

    /// Other participants as last announced over signaling
    pub fn roster(&self) -> Vec<ParticipantSummary> {
        let mut peers: Vec<_> = self.roster.read().values().cloned().collect();
        peers.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        peers
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<Arc<BridgeConnection>> {
        self.connections.read().get(key).cloned()
    }

    pub fn connection_keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self.connections.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut sessions: Vec<_> = self.sessions.read().iter().cloned().collect();
        sessions.sort();
        sessions
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.read().is_empty()
    }

    pub fn add_session(&self, session_id: impl Into<String>) {
        self.sessions.write().insert(session_id.into());
        self.sync_monitoring();
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id);
        self.sync_monitoring();
        removed
    }

    fn sync_monitoring(&self) {
        let monitoring = self.has_sessions();
        for conn in self.connections.read().values() {
            conn.set_monitoring(monitoring);
        }
    }

    pub fn status(&self) -> ContextStatus {
        let connections = self
            .connection_keys()
            .into_iter()
            .filter_map(|key| self.connection(&key))
            .map(|conn| ConnectionStatus {
                key: conn.key().to_string(),
                peer_id: conn.key().peer_id.clone(),
                stream_type: conn.key().stream_type,
                phase: conn.phase(),
                state: conn.state(),
                monitoring: conn.is_monitoring(),
            })
            .collect();

        ContextStatus {
            space_id: self.space_id.clone(),
            agent_id: self.agent_id.clone(),
            state: self.state(),
            connections,
            sessions: self.sessions(),
        }
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| AppError::Transport(format!("signaling closed for {}", self.agent_id)))
    }

    fn signal(&self, kind: SignalKind) -> SignalMessage {
        SignalMessage::new(kind, &self.space_id, &self.agent_id, Role::Agent)
    }

    fn send_signal(&self, msg: SignalMessage) {
        if let Err(e) = self.send(ClientMessage::Signal(msg)) {
            warn!("{}", e);
        }
    }

    /// Ask `peer_id` to announce its publish state for `stream_type` again
    pub fn request_publish_state(&self, peer_id: &str, stream_type: StreamType) {
        debug!(
            "{} requesting {} publish state from {}",
            self.agent_id, stream_type, peer_id
        );
        self.send_signal(
            self.signal(SignalKind::RequestPublishState)
                .to(peer_id)
                .with_stream(stream_type),
        );
    }

    /// Announce departure; the transport stays open until [`AgentContext::shutdown`]
    pub fn send_leave(&self) {
        let leave = ClientMessage::Leave(LeaveRequest {
            space_id: self.space_id.clone(),
            from_id: self.agent_id.clone(),
        });
        if let Err(e) = self.send(leave) {
            debug!("Leave not sent: {}", e);
        }
    }

    /// Dispatch one message from the signaling transport
    pub async fn handle_server_message(self: &Arc<Self>, msg: ServerMessage) {
        match msg {
            ServerMessage::Signal(signal) => {
                if signal.from_id == self.agent_id || !signal.is_for(&self.agent_id) {
                    return;
                }
                self.handle_signal(signal).await;
            }
            ServerMessage::Joined(payload) => self.set_roster(payload.participants),
            ServerMessage::Error(e) => warn!("Signaling error for {}: {}", self.agent_id, e.message),
            other => debug!("Ignoring {:?}", other),
        }
    }

    /// Apply one relayed signal to the per-stream state machine
    pub async fn handle_signal(self: &Arc<Self>, msg: SignalMessage) {
        let signal = match msg.decode() {
            Ok(signal) => signal,
            Err(e) => {
                warn!(
                    "Malformed {} from {}: {}",
                    msg.kind.as_str(),
                    msg.from_id,
                    e
                );
                return;
            }
        };
        let key = ConnectionKey::new(&msg.from_id, msg.stream());

        match signal {
            Signal::PeerJoined => {
                self.roster.write().insert(
                    msg.from_id.clone(),
                    ParticipantSummary::new(&msg.from_id, msg.role),
                );
            }
            Signal::PeerLeft => {
                self.roster.write().remove(&msg.from_id);
                self.remove_peer(&msg.from_id).await;
            }
            Signal::PublishState(intent) => self.on_publish_state(&msg, key, intent).await,
            Signal::Offer(offer) => self.on_offer(key, offer).await,
            Signal::Answer(answer) => self.on_answer(key, answer).await,
            Signal::Candidate(candidate) => self.on_candidate(key, candidate).await,
            Signal::RequestPublishState => {
                debug!("{} publishes nothing, ignoring request", self.agent_id)
            }
            Signal::Unknown => debug!("Unknown signal from {}", msg.from_id),
        }
    }

    async fn on_publish_state(
        self: &Arc<Self>,
        msg: &SignalMessage,
        key: ConnectionKey,
        intent: PublishIntent,
    ) {
        let publishing = intent.is_publishing();
        self.record_publish(msg, &intent, publishing);

        match intent.stream_type {
            StreamType::Camera | StreamType::Audio => {
                let exists = self.connection(&key).is_some();
                if publishing && !exists {
                    self.open(key).await;
                } else if !publishing && exists {
                    self.remove_connection(&key).await;
                }
            }
            // Screen announcements always mean start
            StreamType::Screen => {
                if self.connection(&key).is_none() {
                    self.open(key).await;
                }
            }
            StreamType::Url => debug!("URL stream of {} arrives as capture frames", msg.from_id),
        }
    }

    fn record_publish(&self, msg: &SignalMessage, intent: &PublishIntent, publishing: bool) {
        let mut roster = self.roster.write();
        let entry = roster
            .entry(msg.from_id.clone())
            .or_insert_with(|| ParticipantSummary::new(&msg.from_id, msg.role));
        match intent.stream_type {
            StreamType::Camera => entry.publish_state = intent.media_state(),
            StreamType::Audio => entry.publish_state.audio = publishing,
            StreamType::Screen => entry.screen_sharing = publishing,
            StreamType::Url => {
                entry.url_sharing.active = publishing;
                entry.url_sharing.url = intent.url.clone();
                entry.url_sharing.session_id = intent.session_id.clone();
            }
        }
    }

    async fn open(self: &Arc<Self>, key: ConnectionKey) -> Option<Arc<BridgeConnection>> {
        match self.create_connection(key.clone()).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("Failed to create connection {}: {}", key, e);
                None
            }
        }
    }

    async fn on_offer(self: &Arc<Self>, key: ConnectionKey, offer: SessionDescription) {
        let conn = match self.connection(&key) {
            Some(conn) => conn,
            None => match self.open(key.clone()).await {
                Some(conn) => conn,
                None => return,
            },
        };

        let state = conn.peer().signaling_state();
        if !state.accepts_offer() {
            warn!("Dropping offer for {} in signaling state {}", key, state);
            return;
        }

        conn.set_phase(ConnectionPhase::Negotiating);
        match conn.peer().accept_offer(&offer.sdp).await {
            Ok(answer) => {
                let data = match serde_json::to_value(SessionDescription::answer(answer)) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Failed to encode answer for {}: {}", key, e);
                        return;
                    }
                };
                self.send_signal(
                    self.signal(SignalKind::Answer)
                        .to(&key.peer_id)
                        .with_stream(key.stream_type)
                        .with_data(data),
                );
                debug!("Answered offer on {}", key);
            }
            Err(e) => {
                warn!("Offer on {} failed: {}", key, e);
                conn.set_phase(ConnectionPhase::Failed);
            }
        }
    }

    async fn on_answer(&self, key: ConnectionKey, answer: SessionDescription) {
        let Some(conn) = self.connection(&key) else {
            warn!("Answer for unknown connection {}", key);
            return;
        };
        if let Err(e) = conn.peer().accept_answer(&answer.sdp).await {
            warn!("Answer on {} failed: {}", key, e);
        }
    }

    async fn on_candidate(&self, key: ConnectionKey, candidate: IceCandidate) {
        let Some(conn) = self.connection(&key) else {
            warn!("Candidate for unknown connection {} dropped", key);
            return;
        };
        if !conn.peer().has_remote_description().await {
            warn!("Candidate for {} before remote description dropped", key);
            return;
        }
        if let Err(e) = conn.peer().add_ice_candidate(candidate).await {
            warn!("Candidate on {} failed: {}", key, e);
        }
    }

    /// Create a receive-only connection for `key`
    ///
    /// An existing connection for the key is returned unchanged.
    pub async fn create_connection(
        self: &Arc<Self>,
        key: ConnectionKey,
    ) -> Result<Arc<BridgeConnection>> {
        if let Some(existing) = self.connection(&key) {
            warn!("Connection {} already exists", key);
            return Ok(existing);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = self.deps.peers.create(&key, events_tx).await?;
        let conn = Arc::new(BridgeConnection::new(
            key.clone(),
            peer,
            self.cancel.child_token(),
        ));

        if let Err(e) = conn.peer().add_receive_transceiver(conn.kind()).await {
            conn.teardown().await;
            return Err(e);
        }

        let raced = {
            let mut connections = self.connections.write();
            match connections.get(&key) {
                Some(existing) => Some(existing.clone()),
                None => {
                    connections.insert(key.clone(), conn.clone());
                    None
                }
            }
        };
        if let Some(existing) = raced {
            conn.teardown().await;
            return Ok(existing);
        }

        conn.set_monitoring(self.has_sessions());
        tokio::spawn(self.clone().run_peer_events(conn.clone(), events_rx));
        info!(
            "{} created {} receive connection {}",
            self.agent_id,
            conn.kind(),
            key
        );
        Ok(conn)
    }

    /// Tear down and forget one connection
    pub async fn remove_connection(&self, key: &ConnectionKey) -> bool {
        let conn = self.connections.write().remove(key);
        match conn {
            Some(conn) => {
                conn.teardown().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every connection of `peer_id`
    pub async fn remove_peer(&self, peer_id: &str) -> usize {
        let removed: Vec<_> = {
            let mut connections = self.connections.write();
            let keys: Vec<_> = connections
                .keys()
                .filter(|k| k.peer_id == peer_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| connections.remove(k)).collect()
        };

        for conn in &removed {
            conn.teardown().await;
        }
        if !removed.is_empty() {
            info!("Removed {} connection(s) of {}", removed.len(), peer_id);
        }
        removed.len()
    }

    /// Tear down all connections, stop all sessions, close the transport
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let connections: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.teardown().await;
        }

        let sessions: Vec<_> = self.sessions.write().drain().collect();
        for session in sessions {
            if let Err(e) = self.deps.monitor.stop_monitoring(&session).await {
                warn!("Stopping monitoring session {} failed: {}", session, e);
            }
        }

        self.cancel.cancel();
        self.transport.cancel();
        if self.state() != ContextState::Leaving {
            self.set_state(ContextState::Disconnected);
        }
        info!("Context {} in {} shut down", self.agent_id, self.space_id);
    }

    async fn run_peer_events(
        self: Arc<Self>,
        conn: Arc<BridgeConnection>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let cancel = conn.cancel_token().clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    let data = match serde_json::to_value(&candidate) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("Failed to encode candidate: {}", e);
                            continue;
                        }
                    };
                    self.send_signal(
                        self.signal(SignalKind::Candidate)
                            .to(&conn.key().peer_id)
                            .with_stream(conn.key().stream_type)
                            .with_data(data),
                    );
                }
                PeerEvent::StateChanged(state) => {
                    conn.on_state(state);
                    if state == ConnectionState::Failed {
                        warn!("Connection {} failed", conn.key());
                    }
                }
                PeerEvent::Track(track) => {
                    if !conn.accepts_track(&track) {
                        continue;
                    }
                    let (media_tx, media_rx) = mpsc::unbounded_channel();
                    match self
                        .deps
                        .sinks
                        .attach(track, media_tx, conn.cancel_token().child_token())
                    {
                        Ok(sink) => {
                            conn.attach_sink(sink);
                            tokio::spawn(forward_media(
                                conn.clone(),
                                self.sessions.clone(),
                                self.deps.monitor.clone(),
                                media_rx,
                            ));
                        }
                        Err(e) => warn!("No sink for {}: {}", conn.key(), e),
                    }
                }
            }
        }
        debug!("Event loop for {} ended", conn.key());
    }
}

/// Forward decoded samples to every active monitoring session
async fn forward_media(
    conn: Arc<BridgeConnection>,
    sessions: Arc<RwLock<HashSet<String>>>,
    monitor: Arc<dyn StreamMonitor>,
    mut media: mpsc::UnboundedReceiver<MediaSample>,
) {
    let cancel = conn.cancel_token().clone();
    let key = conn.key().clone();
    loop {
        let sample = tokio::select! {
            _ = cancel.cancelled() => break,
            sample = media.recv() => match sample {
                Some(sample) => sample,
                None => break,
            },
        };
        // Samples queued before teardown are dropped
        if conn.is_closed() {
            break;
        }

        let targets: Vec<String> = sessions.read().iter().cloned().collect();
        if targets.is_empty() {
            continue;
        }

        match sample {
            MediaSample::Audio(batch) => {
                forward_audio(&*monitor, &targets, &key, &batch).await;
            }
            MediaSample::Video(raw) => {
                let Some(frame) = RgbaFrame::from_raw(&raw, &key.peer_id, key.stream_type) else {
                    continue;
                };
                forward_frame(&*monitor, &targets, &frame).await;
            }
        }
    }
}

async fn forward_audio(
    monitor: &dyn StreamMonitor,
    sessions: &[String],
    key: &ConnectionKey,
    batch: &AudioBatch,
) {
    if batch.is_empty() {
        return;
    }
    let wav = Bytes::from(batch.to_wav());
    for session in sessions {
        if let Err(e) = monitor
            .push_audio_data(session, &key.peer_id, key.stream_type, wav.clone())
            .await
        {
            warn!("Audio from {} to session {} failed: {}", key, session, e);
        }
    }
}

/// Push one converted frame to each session
pub async fn forward_frame(monitor: &dyn StreamMonitor, sessions: &[String], frame: &RgbaFrame) {
    for session in sessions {
        if let Err(e) = monitor.push_video_frame(session, frame).await {
            warn!(
                "Frame from {} to session {} failed: {}",
                frame.participant_id, session, e
            );
        }
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent_id", &self.agent_id)
            .field("space_id", &self.space_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::peer::{InboundTrack, MediaKind, SignalingState};
    use crate::bridge::testing::{FakePeerFactory, FakeSinkFactory, QueueSource};
    use crate::media::RawVideoFrame;
    use crate::monitor::InMemoryStreamMonitor;
    use crate::signaling::PublishState;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        ctx: Arc<AgentContext>,
        peers: Arc<FakePeerFactory>,
        sinks: Arc<FakeSinkFactory>,
        monitor: Arc<InMemoryStreamMonitor>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
    }

    impl Harness {
        fn new() -> Self {
            let peers = FakePeerFactory::new();
            let sinks = FakeSinkFactory::new();
            let monitor = Arc::new(InMemoryStreamMonitor::new());
            let (tx, outbound) = mpsc::unbounded_channel();
            let ctx = AgentContext::new(
                "agent",
                "s1",
                tx,
                CancellationToken::new(),
                BridgeDeps {
                    peers: peers.clone(),
                    sinks: sinks.clone(),
                    monitor: monitor.clone(),
                },
            );
            Self {
                ctx,
                peers,
                sinks,
                monitor,
                outbound,
            }
        }

        async fn deliver(&self, msg: SignalMessage) {
            self.ctx
                .handle_server_message(ServerMessage::Signal(msg))
                .await;
        }

        fn sent(&mut self) -> Vec<SignalMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.outbound.try_recv() {
                if let ClientMessage::Signal(signal) = msg {
                    out.push(signal);
                }
            }
            out
        }
    }

    fn publish(from: &str, stream: StreamType, publishing: bool) -> SignalMessage {
        SignalMessage::new(SignalKind::PublishState, "s1", from, Role::Human)
            .with_stream(stream)
            .with_data(json!({ "publishing": publishing }))
    }

    fn legacy(from: &str, stream: StreamType, audio: bool, video: bool) -> SignalMessage {
        let mut msg =
            SignalMessage::new(SignalKind::PublishState, "s1", from, Role::Human).with_stream(stream);
        msg.publish = Some(PublishState { audio, video });
        msg
    }

    fn offer(from: &str, stream: StreamType) -> SignalMessage {
        SignalMessage::new(SignalKind::Offer, "s1", from, Role::Human)
            .to("agent")
            .with_stream(stream)
            .with_data(json!({ "type": "offer", "sdp": "v=0 remote" }))
    }

    fn candidate(from: &str, stream: StreamType) -> SignalMessage {
        SignalMessage::new(SignalKind::Candidate, "s1", from, Role::Human)
            .to("agent")
            .with_stream(stream)
            .with_data(json!({ "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host" }))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_camera_publish_creates_receive_only_connection() {
        let mut h = Harness::new();

        h.deliver(publish("P1", StreamType::Camera, true)).await;
        h.deliver(publish("P1", StreamType::Camera, true)).await;

        let key = ConnectionKey::new("P1", StreamType::Camera);
        assert_eq!(h.ctx.connection_keys(), vec![key.clone()]);
        assert_eq!(h.peers.created(), vec![key.clone()]);
        assert_eq!(h.peers.peer(&key).unwrap().transceivers(), vec![MediaKind::Video]);
        assert!(h.sent().iter().all(|s| s.kind != SignalKind::Offer));
    }

    #[tokio::test]
    async fn test_camera_unpublish_tears_down() {
        let h = Harness::new();
        h.deliver(publish("P1", StreamType::Camera, true)).await;
        let key = ConnectionKey::new("P1", StreamType::Camera);
        let conn = h.ctx.connection(&key).unwrap();

        h.deliver(publish("P1", StreamType::Camera, false)).await;
        h.deliver(publish("P1", StreamType::Camera, false)).await;

        assert!(h.ctx.connection_keys().is_empty());
        assert!(conn.is_closed());
        assert_eq!(h.peers.peer(&key).unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_legacy_audio_requires_audio_without_video() {
        let h = Harness::new();

        h.deliver(legacy("P1", StreamType::Audio, true, true)).await;
        assert!(h.ctx.connection_keys().is_empty());

        h.deliver(legacy("P1", StreamType::Audio, true, false)).await;
        let key = ConnectionKey::new("P1", StreamType::Audio);
        assert_eq!(h.ctx.connection_keys(), vec![key.clone()]);
        assert_eq!(h.peers.peer(&key).unwrap().transceivers(), vec![MediaKind::Audio]);

        // Legacy camera: either flag means publishing
        h.deliver(legacy("P2", StreamType::Camera, true, false)).await;
        assert!(h
            .ctx
            .connection(&ConnectionKey::new("P2", StreamType::Camera))
            .is_some());
    }

    #[tokio::test]
    async fn test_screen_announcement_always_starts() {
        let h = Harness::new();
        h.deliver(publish("P1", StreamType::Screen, false)).await;
        assert_eq!(
            h.ctx.connection_keys(),
            vec![ConnectionKey::new("P1", StreamType::Screen)]
        );
    }

    #[tokio::test]
    async fn test_early_candidate_dropped_then_negotiation_succeeds() {
        let mut h = Harness::new();
        let key = ConnectionKey::new("P1", StreamType::Screen);

        h.deliver(candidate("P1", StreamType::Screen)).await;
        assert!(h.ctx.connection(&key).is_none());

        h.deliver(offer("P1", StreamType::Screen)).await;
        let peer = h.peers.peer(&key).unwrap();
        assert_eq!(peer.offers(), vec!["v=0 remote".to_string()]);
        assert_eq!(h.ctx.connection(&key).unwrap().phase(), ConnectionPhase::Negotiating);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        let answer = &sent[0];
        assert_eq!(answer.kind, SignalKind::Answer);
        assert_eq!(answer.target_id.as_deref(), Some("P1"));
        assert_eq!(answer.stream_type, Some(StreamType::Screen));
        assert_eq!(answer.data.as_ref().unwrap()["sdp"], "answer:v=0 remote");

        h.deliver(candidate("P1", StreamType::Screen)).await;
        assert_eq!(peer.candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_candidate_without_remote_description_dropped() {
        let h = Harness::new();
        h.deliver(publish("P1", StreamType::Camera, true)).await;

        h.deliver(candidate("P1", StreamType::Camera)).await;

        let peer = h.peers.peer(&ConnectionKey::new("P1", StreamType::Camera)).unwrap();
        assert!(peer.candidates().is_empty());
    }

    #[tokio::test]
    async fn test_offer_in_wrong_state_dropped() {
        let mut h = Harness::new();
        h.deliver(publish("P1", StreamType::Camera, true)).await;
        let peer = h.peers.peer(&ConnectionKey::new("P1", StreamType::Camera)).unwrap();
        peer.set_signaling_state(SignalingState::HaveLocalOffer);

        h.deliver(offer("P1", StreamType::Camera)).await;

        assert!(peer.offers().is_empty());
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_answer_for_missing_connection_ignored() {
        let h = Harness::new();
        let answer = SignalMessage::new(SignalKind::Answer, "s1", "P1", Role::Human)
            .to("agent")
            .with_data(json!({ "type": "answer", "sdp": "v=0" }));

        h.deliver(answer).await;

        assert!(h.peers.created().is_empty());
    }

    #[tokio::test]
    async fn test_signals_for_other_targets_ignored() {
        let h = Harness::new();
        let msg = offer("P1", StreamType::Camera).to("someone-else");
        h.deliver(msg).await;
        assert!(h.peers.created().is_empty());
    }

    #[tokio::test]
    async fn test_peer_left_removes_only_that_peer() {
        let h = Harness::new();
        h.deliver(publish("P1", StreamType::Camera, true)).await;
        h.deliver(publish("P1", StreamType::Screen, true)).await;
        h.deliver(publish("P10", StreamType::Camera, true)).await;

        h.deliver(SignalMessage::new(SignalKind::PeerLeft, "s1", "P1", Role::Human))
            .await;

        assert_eq!(
            h.ctx.connection_keys(),
            vec![ConnectionKey::new("P10", StreamType::Camera)]
        );
    }

    #[tokio::test]
    async fn test_local_candidates_sent_to_remote() {
        let mut h = Harness::new();
        h.deliver(publish("P1", StreamType::Screen, true)).await;
        let key = ConnectionKey::new("P1", StreamType::Screen);

        assert!(h.peers.emit(
            &key,
            PeerEvent::LocalCandidate(IceCandidate::new("candidate:local"))
        ));

        let mut sent = Vec::new();
        assert!(
            eventually(|| {
                sent.extend(h.sent());
                !sent.is_empty()
            })
            .await
        );
        assert_eq!(sent[0].kind, SignalKind::Candidate);
        assert_eq!(sent[0].target_id.as_deref(), Some("P1"));
        assert_eq!(sent[0].stream_type, Some(StreamType::Screen));
    }

    #[tokio::test]
    async fn test_wrong_kind_track_not_attached() {
        let h = Harness::new();
        h.deliver(publish("P1", StreamType::Camera, true)).await;
        let key = ConnectionKey::new("P1", StreamType::Camera);

        h.peers.emit(
            &key,
            PeerEvent::Track(InboundTrack {
                kind: MediaKind::Audio,
                codec: "audio/opus".to_string(),
                source: QueueSource::new(vec![]),
            }),
        );
        h.peers.emit(
            &key,
            PeerEvent::Track(InboundTrack {
                kind: MediaKind::Video,
                codec: "video/vp8".to_string(),
                source: QueueSource::new(vec![]),
            }),
        );

        assert!(eventually(|| h.sinks.attached_count() == 1).await);
        assert!(h.ctx.connection(&key).unwrap().has_sink());
    }

    #[tokio::test]
    async fn test_media_forwarded_to_sessions() {
        let h = Harness::new();
        let session = h.monitor.start_monitoring("agent", "s1").await.unwrap();
        h.ctx.add_session(session.clone());

        h.deliver(publish("P1", StreamType::Camera, true)).await;
        h.deliver(legacy("P1", StreamType::Audio, true, false)).await;
        let camera = ConnectionKey::new("P1", StreamType::Camera);
        let audio = ConnectionKey::new("P1", StreamType::Audio);
        assert!(h.ctx.connection(&camera).unwrap().is_monitoring());

        h.peers.emit(
            &camera,
            PeerEvent::Track(InboundTrack {
                kind: MediaKind::Video,
                codec: "video/vp8".to_string(),
                source: QueueSource::new(vec![]),
            }),
        );
        assert!(eventually(|| h.sinks.attached_count() == 1).await);
        h.peers.emit(
            &audio,
            PeerEvent::Track(InboundTrack {
                kind: MediaKind::Audio,
                codec: "audio/opus".to_string(),
                source: QueueSource::new(vec![]),
            }),
        );
        assert!(eventually(|| h.sinks.attached_count() == 2).await);

        let video_out = h.sinks.output(0).unwrap();
        video_out
            .send(MediaSample::Video(RawVideoFrame::new(2, 1, vec![9u8; 8])))
            .unwrap();
        assert!(eventually(|| h.monitor.last_frame(&session).is_some()).await);
        let frame = h.monitor.last_frame(&session).unwrap();
        assert_eq!(frame.participant_id, "P1");
        assert_eq!(frame.stream_type, StreamType::Camera);

        let audio_out = h.sinks.output(1).unwrap();
        audio_out
            .send(MediaSample::Audio(AudioBatch::new(vec![], 48_000)))
            .unwrap();
        audio_out
            .send(MediaSample::Audio(AudioBatch::new(vec![1; 480], 48_000)))
            .unwrap();
        assert!(eventually(|| h.monitor.last_audio(&session).is_some()).await);
        assert_eq!(h.monitor.last_audio(&session).unwrap().len(), 44 + 960);
        let streams = h.monitor.active_streams(&session).await.unwrap();
        let audio_stream = streams
            .iter()
            .find(|s| s.stream_type == StreamType::Audio)
            .unwrap();
        assert_eq!(audio_stream.audio_chunks, 1);
    }

    #[tokio::test]
    async fn test_no_forwarding_after_teardown() {
        let h = Harness::new();
        let session = h.monitor.start_monitoring("agent", "s1").await.unwrap();
        h.ctx.add_session(session.clone());
        h.deliver(publish("P1", StreamType::Camera, true)).await;
        let key = ConnectionKey::new("P1", StreamType::Camera);
        h.peers.emit(
            &key,
            PeerEvent::Track(InboundTrack {
                kind: MediaKind::Video,
                codec: "video/vp8".to_string(),
                source: QueueSource::new(vec![]),
            }),
        );
        assert!(eventually(|| h.sinks.attached_count() == 1).await);
        let out = h.sinks.output(0).unwrap();

        h.ctx.remove_connection(&key).await;
        assert_eq!(h.sinks.sink(0).unwrap().stops(), 1);
        let _ = out.send(MediaSample::Video(RawVideoFrame::new(1, 1, vec![0u8; 4])));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.monitor.last_frame(&session).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let h = Harness::new();
        let session = h.monitor.start_monitoring("agent", "s1").await.unwrap();
        h.ctx.add_session(session);
        h.deliver(publish("P1", StreamType::Camera, true)).await;

        h.ctx.shutdown().await;
        h.ctx.shutdown().await;

        assert!(h.ctx.connection_keys().is_empty());
        assert!(h.ctx.sessions().is_empty());
        assert_eq!(h.monitor.session_count(), 0);
        assert!(h.ctx.transport_token().is_cancelled());
        assert_eq!(h.ctx.state(), ContextState::Disconnected);
    }

    #[tokio::test]
    async fn test_roster_tracks_signaling() {
        let h = Harness::new();
        h.deliver(SignalMessage::new(SignalKind::PeerJoined, "s1", "P1", Role::Human))
            .await;
        h.deliver(publish("P1", StreamType::Screen, true)).await;
        h.deliver(SignalMessage::new(SignalKind::PeerJoined, "s1", "P2", Role::Human))
            .await;

        let roster = h.ctx.roster();
        assert_eq!(roster.len(), 2);
        assert!(roster[0].screen_sharing);

        h.deliver(SignalMessage::new(SignalKind::PeerLeft, "s1", "P2", Role::Human))
            .await;
        assert_eq!(h.ctx.roster().len(), 1);
    }
}
