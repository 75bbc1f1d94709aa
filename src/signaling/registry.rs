//! In-memory participant directory and relay
//!
//! The registry owns every participant and stream record. All mutations
//! happen inside a single critical section of one `RwLock`, and the lock is
//! never held across an `.await`, so each update is atomic with respect to
//! the others and the last writer wins.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    ParticipantSummary, PublishIntent, PublishState, Role, ServerMessage, SignalKind,
    SignalMessage, StreamType, UrlSharing,
};
use crate::error::{AppError, Result};
use crate::membership::MembershipStore;

/// Identifier of one transport connection
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Transport handle of a connected participant
///
/// Cloning is cheap; all clones refer to the same transport.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
    closer: CancellationToken,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            closer: CancellationToken::new(),
        }
    }

    /// Create a handle together with the receiving end of its outbound queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message for this transport
    pub fn send(&self, msg: ServerMessage) -> Result<()> {
        if self.closer.is_cancelled() {
            return Err(AppError::Transport(format!("connection {} closed", self.id)));
        }
        self.tx
            .send(msg)
            .map_err(|_| AppError::Transport(format!("connection {} closed", self.id)))
    }

    pub fn is_open(&self) -> bool {
        !self.closer.is_cancelled() && !self.tx.is_closed()
    }

    /// Force-close the transport; the socket task observes [`ClientHandle::closed`]
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Resolves once the transport has been force-closed
    pub async fn closed(&self) {
        self.closer.cancelled().await
    }
}

/// Accepted connection types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    WebSocket,
    /// In-process transport used by the agent bridge
    Local,
}

impl FromStr for ConnectionType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "websocket" | "ws" => Ok(ConnectionType::WebSocket),
            "local" => Ok(ConnectionType::Local),
            other => Err(AppError::Forbidden(format!(
                "Unsupported connection type: {}",
                other
            ))),
        }
    }
}

/// Identity of a joining participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub space_id: String,
    pub participant_id: String,
    pub role: Role,
}

impl ClientContext {
    pub fn new(space_id: impl Into<String>, participant_id: impl Into<String>, role: Role) -> Self {
        Self {
            space_id: space_id.into(),
            participant_id: participant_id.into(),
            role,
        }
    }
}

/// Per-stream record of a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub stream_type: StreamType,
    pub is_active: bool,
    pub publish_state: PublishState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StreamInfo {
    fn inactive(stream_type: StreamType) -> Self {
        Self {
            stream_type,
            is_active: false,
            publish_state: PublishState::default(),
            url: None,
            session_id: None,
        }
    }
}

/// Exactly one record per stream type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSet {
    pub camera: StreamInfo,
    pub screen: StreamInfo,
    pub url: StreamInfo,
}

impl Default for StreamSet {
    fn default() -> Self {
        Self {
            camera: StreamInfo::inactive(StreamType::Camera),
            screen: StreamInfo::inactive(StreamType::Screen),
            url: StreamInfo::inactive(StreamType::Url),
        }
    }
}

impl StreamSet {
    /// Record for a stream type; audio is carried by the camera record
    pub fn get(&self, stream_type: StreamType) -> &StreamInfo {
        match stream_type {
            StreamType::Camera | StreamType::Audio => &self.camera,
            StreamType::Screen => &self.screen,
            StreamType::Url => &self.url,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamInfo> {
        [&self.camera, &self.screen, &self.url].into_iter()
    }
}

struct Participant {
    role: Role,
    handle: ClientHandle,
    publish_state: PublishState,
    screen_sharing: bool,
    url_sharing: UrlSharing,
    streams: StreamSet,
    joined_at: DateTime<Utc>,
}

impl Participant {
    fn new(role: Role, handle: ClientHandle) -> Self {
        Self {
            role,
            handle,
            publish_state: PublishState::default(),
            screen_sharing: false,
            url_sharing: UrlSharing::default(),
            streams: StreamSet::default(),
            joined_at: Utc::now(),
        }
    }

    fn summary(&self, participant_id: &str) -> ParticipantSummary {
        ParticipantSummary {
            participant_id: participant_id.to_string(),
            role: self.role,
            publish_state: self.publish_state,
            screen_sharing: self.screen_sharing,
            url_sharing: self.url_sharing.clone(),
        }
    }

    fn set_publish_state(&mut self, state: PublishState) -> StreamInfo {
        self.publish_state = state;
        self.streams.camera.publish_state = state;
        self.streams.camera.is_active = state.is_active();
        self.streams.camera.clone()
    }

    fn set_screen_sharing(&mut self, sharing: bool) -> StreamInfo {
        self.screen_sharing = sharing;
        self.streams.screen.is_active = sharing;
        self.streams.screen.publish_state = PublishState {
            audio: false,
            video: sharing,
        };
        self.streams.screen.clone()
    }

    fn set_url_sharing(&mut self, sharing: UrlSharing) -> StreamInfo {
        self.streams.url.is_active = sharing.active;
        self.streams.url.url = sharing.url.clone();
        self.streams.url.session_id = sharing.session_id.clone();
        self.url_sharing = sharing;
        self.streams.url.clone()
    }

    /// Merge a publish announcement into the record of its stream type
    fn apply_intent(&mut self, intent: &PublishIntent) -> StreamInfo {
        match intent.stream_type {
            StreamType::Camera => self.set_publish_state(intent.media_state()),
            StreamType::Audio => self.set_publish_state(PublishState {
                audio: intent.is_publishing(),
                video: self.publish_state.video,
            }),
            StreamType::Screen => self.set_screen_sharing(intent.is_publishing()),
            StreamType::Url => {
                let current = &self.url_sharing;
                let sharing = UrlSharing {
                    active: intent.is_publishing(),
                    url: intent.url.clone().or_else(|| current.url.clone()),
                    session_id: intent
                        .session_id
                        .clone()
                        .or_else(|| current.session_id.clone()),
                };
                self.set_url_sharing(sharing)
            }
        }
    }
}

/// Active stream entry returned by [`SpaceRegistry::get_space_streams`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceStream {
    pub participant_id: String,
    pub stream_type: StreamType,
    pub is_active: bool,
}

/// Active stream entry enriched with participant identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStream {
    pub participant_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stream: StreamInfo,
}

/// Result of a successful registration
#[derive(Debug, Clone)]
pub struct Registration {
    /// Other participants already in the space
    pub participants: Vec<ParticipantSummary>,
    /// Whether an older transport for the same participant was replaced
    pub replaced: bool,
}

#[derive(Default)]
struct RegistryInner {
    spaces: HashMap<String, HashMap<String, Participant>>,
    by_connection: HashMap<ConnectionId, (String, String)>,
}

/// Per-space participant directory
pub struct SpaceRegistry {
    inner: RwLock<RegistryInner>,
    membership: Option<Arc<dyn MembershipStore>>,
}

impl SpaceRegistry {
    /// Registry without a membership store; every join is admitted
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            membership: None,
        }
    }

    /// Registry that checks membership on join and records activity
    pub fn with_membership(membership: Arc<dyn MembershipStore>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            membership: Some(membership),
        }
    }

    /// Validate the connection type, then register with membership checks
    pub async fn connect(
        &self,
        ctx: &ClientContext,
        connection_type: &str,
        handle: ClientHandle,
        enforce_membership: bool,
    ) -> Result<Registration> {
        let connection_type = ConnectionType::from_str(connection_type)?;
        debug!(
            "Connecting {} to space {} via {:?}",
            ctx.participant_id, ctx.space_id, connection_type
        );

        if enforce_membership {
            self.register_client_db(ctx, handle).await
        } else {
            Ok(self.register_client(ctx, handle))
        }
    }

    /// Register a participant (idempotent per participant id)
    ///
    /// Re-registering with a different transport force-closes the older one.
    pub fn register_client(&self, ctx: &ClientContext, handle: ClientHandle) -> Registration {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let space = inner.spaces.entry(ctx.space_id.clone()).or_default();

        let mut replaced = false;
        match space.get_mut(&ctx.participant_id) {
            Some(existing) if existing.handle.id() == handle.id() => {
                existing.role = ctx.role;
            }
            Some(existing) => {
                let old = std::mem::replace(existing, Participant::new(ctx.role, handle.clone()));
                inner.by_connection.remove(&old.handle.id());
                old.handle.close();
                replaced = true;
            }
            None => {
                space.insert(
                    ctx.participant_id.clone(),
                    Participant::new(ctx.role, handle.clone()),
                );
            }
        }
        inner.by_connection.insert(
            handle.id(),
            (ctx.space_id.clone(), ctx.participant_id.clone()),
        );

        let participants = space
            .iter()
            .filter(|(id, _)| **id != ctx.participant_id)
            .map(|(id, p)| p.summary(id))
            .collect();

        if replaced {
            info!(
                "Participant {} re-registered in space {}, previous transport closed",
                ctx.participant_id, ctx.space_id
            );
        } else {
            info!(
                "Participant {} ({}) registered in space {}",
                ctx.participant_id, ctx.role, ctx.space_id
            );
        }

        Registration {
            participants,
            replaced,
        }
    }

    /// Register after checking the membership store
    ///
    /// Fails with `NotFound` when the space does not exist and `BadRequest`
    /// when the participant is neither a member nor admissible to a public
    /// space. Activity tracking failures are logged and ignored.
    pub async fn register_client_db(
        &self,
        ctx: &ClientContext,
        handle: ClientHandle,
    ) -> Result<Registration> {
        let Some(store) = self.membership.clone() else {
            return Ok(self.register_client(ctx, handle));
        };

        let space = store
            .find_space(&ctx.space_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Space not found: {}", ctx.space_id)))?;

        if !store.is_member(&ctx.space_id, &ctx.participant_id).await? {
            if space.is_public && space.allows(ctx.role) {
                store
                    .add_member(&ctx.space_id, &ctx.participant_id, ctx.role)
                    .await?;
                info!(
                    "Auto-enrolled {} ({}) into public space {}",
                    ctx.participant_id, ctx.role, ctx.space_id
                );
            } else {
                return Err(AppError::BadRequest(format!(
                    "{} is not a member of space {}",
                    ctx.participant_id, ctx.space_id
                )));
            }
        }

        let registration = self.register_client(ctx, handle);
        self.touch(&ctx.space_id, &ctx.participant_id).await;
        Ok(registration)
    }

    /// Remove the participant registered on this transport
    ///
    /// A transport that was already replaced by a newer registration is
    /// ignored. Returns the removed `(space_id, participant_id)`.
    pub async fn unregister_client(&self, connection_id: ConnectionId) -> Option<(String, String)> {
        let removed = {
            let mut inner = self.inner.write();
            let (space_id, participant_id) = inner.by_connection.remove(&connection_id)?;
            Self::remove_participant(&mut inner, &space_id, &participant_id, Some(connection_id))
                .map(|role| (space_id, participant_id, role))
        };

        let (space_id, participant_id, role) = removed?;
        self.after_removal(&space_id, &participant_id, role).await;
        Some((space_id, participant_id))
    }

    /// Remove a participant by identity regardless of transport
    pub async fn unregister_by_identity(&self, space_id: &str, participant_id: &str) -> bool {
        let role = {
            let mut inner = self.inner.write();
            Self::remove_participant(&mut inner, space_id, participant_id, None)
        };

        match role {
            Some(role) => {
                self.after_removal(space_id, participant_id, role).await;
                true
            }
            None => false,
        }
    }

    fn remove_participant(
        inner: &mut RegistryInner,
        space_id: &str,
        participant_id: &str,
        connection_id: Option<ConnectionId>,
    ) -> Option<Role> {
        let space = inner.spaces.get_mut(space_id)?;
        let current = space.get(participant_id)?;
        if connection_id.is_some_and(|id| id != current.handle.id()) {
            return None;
        }

        let participant = space.remove(participant_id)?;
        inner.by_connection.remove(&participant.handle.id());
        if space.is_empty() {
            inner.spaces.remove(space_id);
            debug!("Space {} is empty, dropped", space_id);
        }
        Some(participant.role)
    }

    async fn after_removal(&self, space_id: &str, participant_id: &str, role: Role) {
        info!("Participant {} left space {}", participant_id, space_id);
        let msg = SignalMessage::new(SignalKind::PeerLeft, space_id, participant_id, role);
        self.broadcast(space_id, &ServerMessage::Signal(msg), Some(participant_id));
        self.touch(space_id, participant_id).await;
    }

    async fn touch(&self, space_id: &str, participant_id: &str) {
        if let Some(store) = &self.membership {
            if let Err(e) = store.touch_last_active(space_id, participant_id).await {
                warn!(
                    "Failed to record activity for {} in {}: {}",
                    participant_id, space_id, e
                );
            }
        }
    }

    /// Send to every open transport in the space except `exclude`
    ///
    /// Returns the number of successful deliveries.
    pub fn broadcast(&self, space_id: &str, msg: &ServerMessage, exclude: Option<&str>) -> usize {
        let recipients: Vec<(String, ClientHandle)> = {
            let inner = self.inner.read();
            match inner.spaces.get(space_id) {
                Some(space) => space
                    .iter()
                    .filter(|(id, _)| Some(id.as_str()) != exclude)
                    .filter(|(_, p)| p.handle.is_open())
                    .map(|(id, p)| (id.clone(), p.handle.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (participant_id, handle) in recipients {
            match handle.send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Failed to deliver to {} in space {}: {}",
                    participant_id, space_id, e
                ),
            }
        }
        delivered
    }

    /// Send to one participant
    pub fn send_to(&self, space_id: &str, participant_id: &str, msg: ServerMessage) -> Result<()> {
        let handle = {
            let inner = self.inner.read();
            inner
                .spaces
                .get(space_id)
                .and_then(|s| s.get(participant_id))
                .map(|p| p.handle.clone())
        };

        match handle {
            Some(handle) => handle.send(msg),
            None => Err(AppError::NotFound(format!(
                "Participant {} not in space {}",
                participant_id, space_id
            ))),
        }
    }

    fn with_participant<T>(
        &self,
        space_id: &str,
        participant_id: &str,
        f: impl FnOnce(&mut Participant) -> T,
    ) -> Option<T> {
        let mut inner = self.inner.write();
        inner
            .spaces
            .get_mut(space_id)
            .and_then(|s| s.get_mut(participant_id))
            .map(f)
    }

    /// Set audio/video publish flags and the camera stream record
    pub fn update_publish_state(
        &self,
        space_id: &str,
        participant_id: &str,
        state: PublishState,
    ) -> Option<StreamInfo> {
        self.with_participant(space_id, participant_id, |p| p.set_publish_state(state))
    }

    /// Set the screen-sharing flag and the screen stream record
    pub fn update_screen_sharing_state(
        &self,
        space_id: &str,
        participant_id: &str,
        sharing: bool,
    ) -> Option<StreamInfo> {
        self.with_participant(space_id, participant_id, |p| p.set_screen_sharing(sharing))
    }

    /// Set URL-sharing state and the url stream record
    pub fn update_url_sharing_state(
        &self,
        space_id: &str,
        participant_id: &str,
        sharing: UrlSharing,
    ) -> Option<StreamInfo> {
        self.with_participant(space_id, participant_id, |p| p.set_url_sharing(sharing))
    }

    /// Apply a publish announcement to the record of its stream type
    ///
    /// Audio and url announcements merge with the current record; the read
    /// and the write happen under one write lock.
    pub fn apply_publish_intent(
        &self,
        space_id: &str,
        participant_id: &str,
        intent: &PublishIntent,
    ) -> Option<StreamInfo> {
        self.with_participant(space_id, participant_id, |p| p.apply_intent(intent))
    }

    /// Record of one stream of one participant
    pub fn stream_info(
        &self,
        space_id: &str,
        participant_id: &str,
        stream_type: StreamType,
    ) -> Option<StreamInfo> {
        let inner = self.inner.read();
        inner
            .spaces
            .get(space_id)
            .and_then(|s| s.get(participant_id))
            .map(|p| p.streams.get(stream_type).clone())
    }

    /// Summary of one participant
    pub fn participant(&self, space_id: &str, participant_id: &str) -> Option<ParticipantSummary> {
        let inner = self.inner.read();
        inner
            .spaces
            .get(space_id)
            .and_then(|s| s.get(participant_id))
            .map(|p| p.summary(participant_id))
    }

    /// Active streams in a space
    pub fn get_space_streams(&self, space_id: &str) -> Vec<SpaceStream> {
        self.get_detailed_space_streams(space_id)
            .into_iter()
            .map(|d| SpaceStream {
                participant_id: d.participant_id,
                stream_type: d.stream.stream_type,
                is_active: d.stream.is_active,
            })
            .collect()
    }

    /// Active streams in a space with participant identity
    pub fn get_detailed_space_streams(&self, space_id: &str) -> Vec<DetailedStream> {
        let inner = self.inner.read();
        let Some(space) = inner.spaces.get(space_id) else {
            return Vec::new();
        };

        let mut streams: Vec<DetailedStream> = space
            .iter()
            .flat_map(|(id, p)| {
                p.streams
                    .iter()
                    .filter(|s| s.is_active)
                    .map(move |s| DetailedStream {
                        participant_id: id.clone(),
                        role: p.role,
                        joined_at: p.joined_at,
                        stream: s.clone(),
                    })
            })
            .collect();
        streams.sort_by(|a, b| {
            (a.participant_id.as_str(), a.stream.stream_type)
                .cmp(&(b.participant_id.as_str(), b.stream.stream_type))
        });
        streams
    }

    /// Participants of a space
    pub fn get_peers(&self, space_id: &str) -> Vec<ParticipantSummary> {
        let inner = self.inner.read();
        let mut peers: Vec<ParticipantSummary> = inner
            .spaces
            .get(space_id)
            .map(|s| s.iter().map(|(id, p)| p.summary(id)).collect())
            .unwrap_or_default();
        peers.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        peers
    }

    /// Identity registered on a transport
    pub fn identity_of(&self, connection_id: ConnectionId) -> Option<(String, String)> {
        self.inner.read().by_connection.get(&connection_id).cloned()
    }

    pub fn space_count(&self) -> usize {
        self.inner.read().spaces.len()
    }

    pub fn participant_count(&self, space_id: &str) -> usize {
        self.inner
            .read()
            .spaces
            .get(space_id)
            .map_or(0, |s| s.len())
    }
}

impl Default for SpaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{MemoryMembershipStore, SpaceRecord};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Membership store whose activity writes always fail
    struct BrokenActivityStore {
        inner: MemoryMembershipStore,
        touches: AtomicUsize,
    }

    #[async_trait]
    impl MembershipStore for BrokenActivityStore {
        async fn find_space(&self, space_id: &str) -> Result<Option<SpaceRecord>> {
            self.inner.find_space(space_id).await
        }

        async fn is_member(&self, space_id: &str, participant_id: &str) -> Result<bool> {
            self.inner.is_member(space_id, participant_id).await
        }

        async fn add_member(&self, space_id: &str, participant_id: &str, role: Role) -> Result<()> {
            self.inner.add_member(space_id, participant_id, role).await
        }

        async fn touch_last_active(&self, _space_id: &str, _participant_id: &str) -> Result<()> {
            self.touches.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Internal("database is locked".to_string()))
        }
    }

    fn ctx(participant: &str) -> ClientContext {
        ClientContext::new("s1", participant, Role::Human)
    }

    #[test]
    fn test_register_is_idempotent_per_transport() {
        let registry = SpaceRegistry::new();
        let (handle, _rx) = ClientHandle::channel();

        registry.register_client(&ctx("p1"), handle.clone());
        let second = registry.register_client(&ctx("p1"), handle.clone());

        assert!(!second.replaced);
        assert_eq!(registry.participant_count("s1"), 1);
        assert!(handle.is_open());
    }

    #[test]
    fn test_reregistration_closes_previous_transport() {
        let registry = SpaceRegistry::new();
        let (first, _rx1) = ClientHandle::channel();
        let (second, _rx2) = ClientHandle::channel();

        registry.register_client(&ctx("p1"), first.clone());
        let outcome = registry.register_client(&ctx("p1"), second.clone());

        assert!(outcome.replaced);
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(registry.participant_count("s1"), 1);
        assert_eq!(
            registry.identity_of(second.id()),
            Some(("s1".to_string(), "p1".to_string()))
        );
        assert!(registry.identity_of(first.id()).is_none());
    }

    #[tokio::test]
    async fn test_stale_transport_unregister_keeps_newest() {
        let registry = SpaceRegistry::new();
        let (first, _rx1) = ClientHandle::channel();
        let (second, _rx2) = ClientHandle::channel();
        let (third, _rx3) = ClientHandle::channel();

        registry.register_client(&ctx("p1"), first.clone());
        registry.register_client(&ctx("p1"), second.clone());
        assert!(registry.unregister_client(first.id()).await.is_none());
        assert_eq!(registry.participant_count("s1"), 1);

        registry.register_client(&ctx("p1"), third.clone());
        assert!(registry.unregister_client(second.id()).await.is_none());
        assert_eq!(registry.participant_count("s1"), 1);

        assert_eq!(
            registry.unregister_client(third.id()).await,
            Some(("s1".to_string(), "p1".to_string()))
        );
        assert_eq!(registry.participant_count("s1"), 0);
        assert_eq!(registry.space_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_broadcasts_peer_left() {
        let registry = SpaceRegistry::new();
        let (h1, _rx1) = ClientHandle::channel();
        let (h2, mut rx2) = ClientHandle::channel();
        registry.register_client(&ctx("p1"), h1.clone());
        registry.register_client(&ctx("p2"), h2);

        registry.unregister_client(h1.id()).await;

        match rx2.try_recv().unwrap() {
            ServerMessage::Signal(msg) => {
                assert_eq!(msg.kind, SignalKind::PeerLeft);
                assert_eq!(msg.from_id, "p1");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(registry.stream_info("s1", "p1", StreamType::Camera).is_none());
    }

    #[test]
    fn test_broadcast_survives_closed_recipient() {
        let registry = SpaceRegistry::new();
        let (h1, rx1) = ClientHandle::channel();
        let (h2, mut rx2) = ClientHandle::channel();
        let (h3, _rx3) = ClientHandle::channel();
        registry.register_client(&ctx("p1"), h1);
        registry.register_client(&ctx("p2"), h2);
        registry.register_client(&ctx("p3"), h3);
        drop(rx1);

        let msg = ServerMessage::Signal(SignalMessage::new(
            SignalKind::RequestPublishState,
            "s1",
            "p3",
            Role::Human,
        ));
        let delivered = registry.broadcast("s1", &msg, Some("p3"));

        assert_eq!(delivered, 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_publish_state_is_idempotent() {
        let registry = SpaceRegistry::new();
        let (handle, _rx) = ClientHandle::channel();
        registry.register_client(&ctx("p1"), handle);

        let state = PublishState {
            audio: true,
            video: false,
        };
        let once = registry.update_publish_state("s1", "p1", state).unwrap();
        let twice = registry.update_publish_state("s1", "p1", state).unwrap();

        assert_eq!(once, twice);
        assert!(twice.is_active);
        assert_eq!(
            registry.participant("s1", "p1").unwrap().publish_state,
            state
        );
    }

    #[test]
    fn test_detailed_streams_only_active() {
        let registry = SpaceRegistry::new();
        let (h1, _rx1) = ClientHandle::channel();
        let (h2, _rx2) = ClientHandle::channel();
        registry.register_client(&ctx("p1"), h1);
        registry.register_client(&ClientContext::new("s1", "bot", Role::Agent), h2);

        registry.update_screen_sharing_state("s1", "p1", true);
        registry.update_url_sharing_state(
            "s1",
            "p1",
            UrlSharing {
                active: true,
                url: Some("https://example.com".to_string()),
                session_id: Some("c1".to_string()),
            },
        );

        let streams = registry.get_detailed_space_streams("s1");
        assert_eq!(streams.len(), 2);
        assert!(streams.iter().all(|s| s.participant_id == "p1"));
        assert_eq!(streams[0].stream.stream_type, StreamType::Screen);
        assert_eq!(streams[1].stream.url.as_deref(), Some("https://example.com"));

        registry.update_screen_sharing_state("s1", "p1", false);
        let streams = registry.get_space_streams("s1");
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].stream_type, StreamType::Url);
    }

    #[test]
    fn test_apply_audio_intent_keeps_video_flag() {
        let registry = SpaceRegistry::new();
        let (handle, _rx) = ClientHandle::channel();
        registry.register_client(&ctx("p1"), handle);
        registry.update_publish_state(
            "s1",
            "p1",
            PublishState {
                audio: false,
                video: true,
            },
        );

        let info = registry
            .apply_publish_intent("s1", "p1", &PublishIntent::explicit(StreamType::Audio, true))
            .unwrap();
        assert_eq!(
            info.publish_state,
            PublishState {
                audio: true,
                video: true
            }
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_sse() {
        let registry = SpaceRegistry::new();
        let (handle, _rx) = ClientHandle::channel();

        let err = registry
            .connect(&ctx("p1"), "sse", handle, false)
            .await
            .unwrap_err();

        assert!(err.is_authorization());
        assert_eq!(registry.space_count(), 0);
    }

    #[tokio::test]
    async fn test_db_registration_rules() {
        let store = Arc::new(MemoryMembershipStore::new());
        store.insert_space(SpaceRecord::new("private", "Private"));
        let mut public = SpaceRecord::new("public", "Public").public();
        public.allow_agents = false;
        store.insert_space(public);
        store.insert_member("private", "member");

        let registry = SpaceRegistry::with_membership(store.clone());

        let (h, _rx) = ClientHandle::channel();
        let err = registry
            .register_client_db(&ClientContext::new("missing", "p1", Role::Human), h)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let (h, _rx) = ClientHandle::channel();
        let err = registry
            .register_client_db(&ClientContext::new("private", "stranger", Role::Human), h)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let (h, _rx) = ClientHandle::channel();
        registry
            .register_client_db(&ClientContext::new("private", "member", Role::Human), h)
            .await
            .unwrap();
        assert_eq!(store.touch_count("private", "member"), 1);

        // Public space auto-enrolls allowed roles only
        let (h, _rx) = ClientHandle::channel();
        registry
            .register_client_db(&ClientContext::new("public", "visitor", Role::Human), h)
            .await
            .unwrap();
        assert!(store.is_member("public", "visitor").await.unwrap());

        let (h, _rx) = ClientHandle::channel();
        let err = registry
            .register_client_db(&ClientContext::new("public", "bot", Role::Agent), h)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(registry.participant_count("public"), 1);
    }

    #[tokio::test]
    async fn test_failing_activity_write_does_not_block_join_or_leave() {
        let inner = MemoryMembershipStore::new();
        inner.insert_space(SpaceRecord::new("s1", "Space"));
        inner.insert_member("s1", "p1");
        let store = Arc::new(BrokenActivityStore {
            inner,
            touches: AtomicUsize::new(0),
        });
        let registry = SpaceRegistry::with_membership(store.clone());

        let (handle, _rx) = ClientHandle::channel();
        let (watcher, mut watcher_rx) = ClientHandle::channel();
        registry.register_client(&ctx("watcher"), watcher);
        registry
            .register_client_db(&ctx("p1"), handle.clone())
            .await
            .unwrap();
        assert_eq!(registry.participant_count("s1"), 2);

        let removed = registry.unregister_client(handle.id()).await;
        assert_eq!(removed, Some(("s1".to_string(), "p1".to_string())));
        assert_eq!(registry.participant_count("s1"), 1);
        assert_eq!(store.touches.load(Ordering::SeqCst), 2);

        // Peers are still told about the departure
        let mut saw_peer_left = false;
        while let Ok(msg) = watcher_rx.try_recv() {
            if let ServerMessage::Signal(signal) = msg {
                saw_peer_left |= signal.kind == SignalKind::PeerLeft;
            }
        }
        assert!(saw_peer_left);
    }

    #[test]
    fn test_concurrent_audio_intents_keep_camera_video() {
        let registry = Arc::new(SpaceRegistry::new());
        let (handle, _rx) = ClientHandle::channel();
        registry.register_client(&ctx("p1"), handle);

        let toggler = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let intent = PublishIntent::explicit(StreamType::Audio, i % 2 == 0);
                    registry.apply_publish_intent("s1", "p1", &intent);
                }
            })
        };
        registry.update_publish_state(
            "s1",
            "p1",
            PublishState {
                audio: false,
                video: true,
            },
        );
        toggler.join().unwrap();

        let info = registry
            .apply_publish_intent("s1", "p1", &PublishIntent::explicit(StreamType::Audio, true))
            .unwrap();
        assert!(info.publish_state.video);
        assert!(registry.participant("s1", "p1").unwrap().publish_state.video);
    }
}
