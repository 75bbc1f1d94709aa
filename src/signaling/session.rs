//! Per-transport signaling session
//!
//! A [`ClientSession`] is driven by one transport (a WebSocket or the
//! in-process bridge channel). It applies the relay rules on top of the
//! shared [`SpaceRegistry`].

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::protocol::{
    CaptureAck, CaptureError, ClientMessage, JoinRequest, JoinedPayload, LeaveRequest,
    ScreenFrame, ServerMessage, Signal, SignalKind, SignalMessage, StartWebCapture,
    StopWebCapture, StreamType, UrlSharing, WebFrame,
};
use super::registry::{ClientContext, ClientHandle, SpaceRegistry};
use crate::events::{CaptureFrameEvent, EventBus, SpaceEvent};

pub struct ClientSession {
    registry: Arc<SpaceRegistry>,
    events: Arc<EventBus>,
    handle: ClientHandle,
    connection_type: String,
    enforce_membership: bool,
    identity: Option<ClientContext>,
}

impl ClientSession {
    pub fn new(
        registry: Arc<SpaceRegistry>,
        events: Arc<EventBus>,
        handle: ClientHandle,
        connection_type: impl Into<String>,
        enforce_membership: bool,
    ) -> Self {
        Self {
            registry,
            events,
            handle,
            connection_type: connection_type.into(),
            enforce_membership,
            identity: None,
        }
    }

    /// Identity this transport joined with
    pub fn identity(&self) -> Option<&ClientContext> {
        self.identity.as_ref()
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Process one inbound message
    pub async fn handle_message(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Join(req) => self.on_join(req).await,
            ClientMessage::Signal(signal) => self.on_signal(signal),
            ClientMessage::Leave(req) => self.on_leave(req).await,
            ClientMessage::StartWebCapture(req) => self.on_start_capture(req),
            ClientMessage::WebFrame(frame) => self.on_web_frame(frame),
            ClientMessage::ScreenFrame(frame) => self.on_screen_frame(frame),
            ClientMessage::StopWebCapture(req) => self.on_stop_capture(req),
        }
    }

    /// Transport ended; drop the registration if it is still ours
    pub async fn close(&mut self) {
        if self.identity.take().is_some() {
            self.registry.unregister_client(self.handle.id()).await;
        }
    }

    async fn on_join(&mut self, req: JoinRequest) {
        let ctx = ClientContext::new(req.space_id, req.from_id, req.role);

        let rejoin = self.identity.as_ref() == Some(&ctx);
        if self.identity.is_some() && !rejoin {
            // One identity per transport; switching spaces leaves the old one
            self.registry.unregister_client(self.handle.id()).await;
            self.identity = None;
        }

        let registration = match self
            .registry
            .connect(
                &ctx,
                &self.connection_type,
                self.handle.clone(),
                self.enforce_membership,
            )
            .await
        {
            Ok(registration) => registration,
            Err(e) => {
                warn!(
                    "Join rejected for {} in space {}: {}",
                    ctx.participant_id, ctx.space_id, e
                );
                self.reply(ServerMessage::error(e.to_string()));
                return;
            }
        };

        self.reply(ServerMessage::Joined(JoinedPayload {
            participants: registration.participants,
        }));

        if rejoin {
            debug!("Duplicate join from {}", ctx.participant_id);
            return;
        }

        let joined = SignalMessage::new(
            SignalKind::PeerJoined,
            &ctx.space_id,
            &ctx.participant_id,
            ctx.role,
        );
        self.registry.broadcast(
            &ctx.space_id,
            &ServerMessage::Signal(joined),
            Some(&ctx.participant_id),
        );
        self.identity = Some(ctx);
    }

    async fn on_leave(&mut self, req: LeaveRequest) {
        if self.joined_as(&req.space_id, &req.from_id).is_none() {
            warn!(
                "Leave for {} in {} does not match this connection",
                req.from_id, req.space_id
            );
            return;
        }
        self.registry.unregister_client(self.handle.id()).await;
        self.identity = None;
    }

    fn on_signal(&mut self, mut msg: SignalMessage) {
        let Some(ctx) = self.joined_as(&msg.space_id, &msg.from_id).cloned() else {
            warn!(
                "Dropping {} from {} in {}: identity does not match this connection",
                msg.kind.as_str(),
                msg.from_id,
                msg.space_id
            );
            return;
        };
        msg.role = ctx.role;

        let signal = match msg.decode() {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Dropping malformed {} from {}: {}", msg.kind.as_str(), msg.from_id, e);
                return;
            }
        };

        match signal {
            Signal::PublishState(intent) => {
                if self
                    .registry
                    .apply_publish_intent(&ctx.space_id, &ctx.participant_id, &intent)
                    .is_none()
                {
                    warn!("Publish state from unregistered {}", ctx.participant_id);
                    return;
                }
                debug!(
                    "{} publish {} = {}",
                    ctx.participant_id,
                    intent.stream_type,
                    intent.is_publishing()
                );
                self.relay(msg);
            }
            Signal::Offer(_)
            | Signal::Answer(_)
            | Signal::Candidate(_)
            | Signal::RequestPublishState => self.relay(msg),
            Signal::PeerJoined | Signal::PeerLeft => {
                debug!("Ignoring client-sent {}", msg.kind.as_str());
            }
            Signal::Unknown => debug!("Ignoring unknown signal from {}", msg.from_id),
        }
    }

    fn on_start_capture(&mut self, req: StartWebCapture) {
        let Some(ctx) = self.joined_as(&req.space_id, &req.from_id).cloned() else {
            self.reply(ServerMessage::WebCaptureError(CaptureError {
                session_id: req.session_id,
                message: "Not joined to this space".to_string(),
            }));
            return;
        };

        if req.url.trim().is_empty() {
            self.reply(ServerMessage::WebCaptureError(CaptureError {
                session_id: req.session_id,
                message: "URL is required".to_string(),
            }));
            return;
        }

        self.registry.update_url_sharing_state(
            &ctx.space_id,
            &ctx.participant_id,
            UrlSharing {
                active: true,
                url: Some(req.url.clone()),
                session_id: Some(req.session_id.clone()),
            },
        );
        info!(
            "{} started web capture {} of {}",
            ctx.participant_id, req.session_id, req.url
        );

        self.reply(ServerMessage::WebCaptureStarted(CaptureAck {
            session_id: req.session_id.clone(),
            url: Some(req.url.clone()),
        }));
        self.announce_url(&ctx, true, Some(req.url), req.session_id);
    }

    fn on_stop_capture(&mut self, req: StopWebCapture) {
        let Some(ctx) = self.joined_as(&req.space_id, &req.from_id).cloned() else {
            warn!("Stop capture from {} without a matching join", req.from_id);
            return;
        };

        self.registry.update_url_sharing_state(
            &ctx.space_id,
            &ctx.participant_id,
            UrlSharing::default(),
        );
        info!("{} stopped web capture {}", ctx.participant_id, req.session_id);

        self.reply(ServerMessage::WebCaptureStopped(CaptureAck {
            session_id: req.session_id.clone(),
            url: None,
        }));
        self.announce_url(&ctx, false, None, req.session_id);
    }

    fn on_web_frame(&self, frame: WebFrame) {
        let Some(ctx) = &self.identity else {
            debug!("Web frame before join dropped");
            return;
        };
        if ctx.participant_id != frame.participant_id {
            warn!(
                "Web frame for {} on connection of {} dropped",
                frame.participant_id, ctx.participant_id
            );
            return;
        }

        self.events.publish(SpaceEvent::WebCaptureFrame(CaptureFrameEvent {
            space_id: ctx.space_id.clone(),
            participant_id: frame.participant_id,
            session_id: Some(frame.session_id),
            frame: frame.frame.into(),
            timestamp: frame.timestamp,
        }));
    }

    fn on_screen_frame(&self, frame: ScreenFrame) {
        if self.joined_as(&frame.space_id, &frame.from_id).is_none() {
            debug!("Screen frame from {} dropped", frame.from_id);
            return;
        }

        self.events.publish(SpaceEvent::ScreenShareFrame(CaptureFrameEvent {
            space_id: frame.space_id,
            participant_id: frame.from_id,
            session_id: None,
            frame: frame.frame.into(),
            timestamp: frame.timestamp,
        }));
    }

    fn announce_url(&self, ctx: &ClientContext, active: bool, url: Option<String>, session_id: String) {
        let msg = SignalMessage::new(
            SignalKind::PublishState,
            &ctx.space_id,
            &ctx.participant_id,
            ctx.role,
        )
        .with_stream(StreamType::Url)
        .with_data(json!({
            "publishing": active,
            "url": url,
            "sessionId": session_id,
        }));
        self.registry.broadcast(
            &ctx.space_id,
            &ServerMessage::Signal(msg),
            Some(&ctx.participant_id),
        );
    }

    /// Route to the target when present, otherwise to everyone but the sender
    fn relay(&self, msg: SignalMessage) {
        let space_id = msg.space_id.clone();
        let from_id = msg.from_id.clone();

        match msg.target_id.clone() {
            Some(target) => {
                if let Err(e) = self
                    .registry
                    .send_to(&space_id, &target, ServerMessage::Signal(msg))
                {
                    warn!("Relay from {} to {} failed: {}", from_id, target, e);
                }
            }
            None => {
                self.registry
                    .broadcast(&space_id, &ServerMessage::Signal(msg), Some(&from_id));
            }
        }
    }

    fn joined_as(&self, space_id: &str, participant_id: &str) -> Option<&ClientContext> {
        self.identity
            .as_ref()
            .filter(|ctx| ctx.space_id == space_id && ctx.participant_id == participant_id)
    }

    fn reply(&self, msg: ServerMessage) {
        if let Err(e) = self.handle.send(msg) {
            debug!("Reply dropped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::{PublishState, Role};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Client {
        session: ClientSession,
        rx: UnboundedReceiver<ServerMessage>,
    }

    fn client(registry: &Arc<SpaceRegistry>, events: &Arc<EventBus>) -> Client {
        let (handle, rx) = ClientHandle::channel();
        Client {
            session: ClientSession::new(registry.clone(), events.clone(), handle, "websocket", false),
            rx,
        }
    }

    fn join(space: &str, from: &str) -> ClientMessage {
        ClientMessage::Join(JoinRequest {
            space_id: space.to_string(),
            from_id: from.to_string(),
            role: Role::Human,
        })
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn signal_kinds(messages: &[ServerMessage]) -> Vec<SignalKind> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Signal(s) => Some(s.kind),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_join_replies_and_announces() {
        let registry = Arc::new(SpaceRegistry::new());
        let events = Arc::new(EventBus::new());
        let mut a = client(&registry, &events);
        let mut b = client(&registry, &events);

        a.session.handle_message(join("s1", "a")).await;
        b.session.handle_message(join("s1", "b")).await;

        let to_b = drain(&mut b.rx);
        match &to_b[0] {
            ServerMessage::Joined(payload) => {
                assert_eq!(payload.participants.len(), 1);
                assert_eq!(payload.participants[0].participant_id, "a");
            }
            other => panic!("expected joined, got {:?}", other),
        }
        let to_a = drain(&mut a.rx);
        assert_eq!(signal_kinds(&to_a), vec![SignalKind::PeerJoined]);
    }

    #[tokio::test]
    async fn test_rejected_connection_type_sends_error() {
        let registry = Arc::new(SpaceRegistry::new());
        let events = Arc::new(EventBus::new());
        let (handle, mut rx) = ClientHandle::channel();
        let mut session = ClientSession::new(registry.clone(), events, handle, "sse", false);

        session.handle_message(join("s1", "a")).await;

        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Error(_)));
        assert!(session.identity().is_none());
        assert_eq!(registry.space_count(), 0);
    }

    #[tokio::test]
    async fn test_spoofed_signal_is_dropped() {
        let registry = Arc::new(SpaceRegistry::new());
        let events = Arc::new(EventBus::new());
        let mut a = client(&registry, &events);
        let mut b = client(&registry, &events);
        a.session.handle_message(join("s1", "a")).await;
        b.session.handle_message(join("s1", "b")).await;
        drain(&mut a.rx);

        let spoofed = SignalMessage::new(SignalKind::RequestPublishState, "s1", "a", Role::Human);
        b.session.handle_message(ClientMessage::Signal(spoofed)).await;

        assert!(drain(&mut a.rx).is_empty());
    }

    #[tokio::test]
    async fn test_targeted_offer_reaches_only_target() {
        let registry = Arc::new(SpaceRegistry::new());
        let events = Arc::new(EventBus::new());
        let mut a = client(&registry, &events);
        let mut b = client(&registry, &events);
        let mut c = client(&registry, &events);
        a.session.handle_message(join("s1", "a")).await;
        b.session.handle_message(join("s1", "b")).await;
        c.session.handle_message(join("s1", "c")).await;
        drain(&mut a.rx);
        drain(&mut b.rx);
        drain(&mut c.rx);

        let offer = SignalMessage::new(SignalKind::Offer, "s1", "a", Role::Human)
            .to("b")
            .with_data(json!({"type": "offer", "sdp": "v=0"}));
        a.session.handle_message(ClientMessage::Signal(offer)).await;

        assert_eq!(signal_kinds(&drain(&mut b.rx)), vec![SignalKind::Offer]);
        assert!(drain(&mut c.rx).is_empty());
        assert!(drain(&mut a.rx).is_empty());
    }

    #[tokio::test]
    async fn test_publish_state_updates_registry_then_relays() {
        let registry = Arc::new(SpaceRegistry::new());
        let events = Arc::new(EventBus::new());
        let mut a = client(&registry, &events);
        let mut b = client(&registry, &events);
        a.session.handle_message(join("s1", "a")).await;
        b.session.handle_message(join("s1", "b")).await;
        drain(&mut b.rx);

        let mut publish = SignalMessage::new(SignalKind::PublishState, "s1", "a", Role::Human);
        publish.publish = Some(PublishState {
            audio: true,
            video: true,
        });
        a.session.handle_message(ClientMessage::Signal(publish)).await;

        assert!(registry.stream_info("s1", "a", StreamType::Camera).unwrap().is_active);
        assert_eq!(signal_kinds(&drain(&mut b.rx)), vec![SignalKind::PublishState]);
    }

    #[tokio::test]
    async fn test_web_capture_lifecycle() {
        let registry = Arc::new(SpaceRegistry::new());
        let events = Arc::new(EventBus::new());
        let mut frames = events.subscribe();
        let mut a = client(&registry, &events);
        a.session.handle_message(join("s1", "a")).await;
        drain(&mut a.rx);

        a.session
            .handle_message(ClientMessage::StartWebCapture(StartWebCapture {
                space_id: "s1".to_string(),
                from_id: "a".to_string(),
                url: String::new(),
                session_id: "c1".to_string(),
            }))
            .await;
        assert!(matches!(
            a.rx.try_recv().unwrap(),
            ServerMessage::WebCaptureError(_)
        ));

        a.session
            .handle_message(ClientMessage::StartWebCapture(StartWebCapture {
                space_id: "s1".to_string(),
                from_id: "a".to_string(),
                url: "https://example.com".to_string(),
                session_id: "c1".to_string(),
            }))
            .await;
        assert!(matches!(
            a.rx.try_recv().unwrap(),
            ServerMessage::WebCaptureStarted(_)
        ));
        let url = registry.stream_info("s1", "a", StreamType::Url).unwrap();
        assert!(url.is_active);
        assert_eq!(url.session_id.as_deref(), Some("c1"));

        a.session
            .handle_message(ClientMessage::WebFrame(WebFrame {
                session_id: "c1".to_string(),
                participant_id: "a".to_string(),
                frame: "aGVsbG8=".to_string(),
                timestamp: 7,
            }))
            .await;
        match frames.try_recv().unwrap() {
            SpaceEvent::WebCaptureFrame(frame) => {
                assert_eq!(frame.space_id, "s1");
                assert_eq!(frame.session_id.as_deref(), Some("c1"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        a.session
            .handle_message(ClientMessage::StopWebCapture(StopWebCapture {
                space_id: "s1".to_string(),
                from_id: "a".to_string(),
                session_id: "c1".to_string(),
            }))
            .await;
        assert!(matches!(
            a.rx.try_recv().unwrap(),
            ServerMessage::WebCaptureStopped(_)
        ));
        assert!(!registry.stream_info("s1", "a", StreamType::Url).unwrap().is_active);
    }

    #[tokio::test]
    async fn test_close_broadcasts_peer_left() {
        let registry = Arc::new(SpaceRegistry::new());
        let events = Arc::new(EventBus::new());
        let mut a = client(&registry, &events);
        let mut b = client(&registry, &events);
        a.session.handle_message(join("s1", "a")).await;
        b.session.handle_message(join("s1", "b")).await;
        drain(&mut b.rx);

        a.session.close().await;

        assert_eq!(signal_kinds(&drain(&mut b.rx)), vec![SignalKind::PeerLeft]);
        assert_eq!(registry.participant_count("s1"), 1);
    }
}
