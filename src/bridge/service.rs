//! Agent bridge service
//!
//! Owns every [`AgentContext`] of the process, keyed by (space, agent), and
//! orchestrates monitoring sessions on top of them.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{forward_frame, AgentContext, BridgeDeps, ContextState, ContextStatus};
use super::transport::{SignalingChannel, SignalingConnector};
use crate::config::BridgeConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SpaceEvent};
use crate::media::{ImageDecoder, RgbaFrame};
use crate::signaling::{
    ClientMessage, JoinRequest, ParticipantSummary, Role, ServerMessage, SpaceRegistry,
    StreamType,
};

type ContextKey = (String, String);
type ContextMap = Arc<RwLock<HashMap<ContextKey, Arc<AgentContext>>>>;

/// Timing and identity defaults of the bridge
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub join_timeout: Duration,
    pub stabilization: Duration,
    pub agent_id: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for BridgeOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            stabilization: Duration::from_millis(config.stabilization_ms),
            agent_id: config.agent_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub contexts: Vec<ContextStatus>,
}

pub struct AgentBridge {
    connector: Arc<dyn SignalingConnector>,
    deps: BridgeDeps,
    images: Arc<dyn ImageDecoder>,
    /// Set when the bridge shares this process's registry
    registry: Option<Arc<SpaceRegistry>>,
    contexts: ContextMap,
    /// Serializes joins per (space, agent)
    join_locks: parking_lot::Mutex<HashMap<ContextKey, Arc<Mutex<()>>>>,
    options: BridgeOptions,
    shutdown: CancellationToken,
}

impl AgentBridge {
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        deps: BridgeDeps,
        images: Arc<dyn ImageDecoder>,
        options: BridgeOptions,
    ) -> Self {
        Self {
            connector,
            deps,
            images,
            registry: None,
            contexts: Arc::new(RwLock::new(HashMap::new())),
            join_locks: parking_lot::Mutex::new(HashMap::new()),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Read active streams from a local registry instead of the roster
    pub fn with_registry(mut self, registry: Arc<SpaceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn default_agent_id(&self) -> &str {
        &self.options.agent_id
    }

    pub fn context(&self, space_id: &str, agent_id: &str) -> Option<Arc<AgentContext>> {
        self.contexts
            .read()
            .get(&(space_id.to_string(), agent_id.to_string()))
            .cloned()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.read().len()
    }

    /// Join `space_id` as `agent_id`
    ///
    /// Returns the existing context when already joined. On failure the
    /// transport is closed and no context is registered.
    pub async fn join_space_as_agent(
        &self,
        space_id: &str,
        agent_id: &str,
    ) -> Result<Arc<AgentContext>> {
        let lock = self
            .join_locks
            .lock()
            .entry((space_id.to_string(), agent_id.to_string()))
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.join_locked(space_id, agent_id).await
        };

        drop(lock);
        self.join_locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        result
    }

    async fn join_locked(&self, space_id: &str, agent_id: &str) -> Result<Arc<AgentContext>> {
        if let Some(ctx) = self.context(space_id, agent_id) {
            if ctx.state() == ContextState::Joined {
                debug!("{} already joined {}", agent_id, space_id);
                return Ok(ctx);
            }
        }

        let SignalingChannel {
            outbound,
            mut inbound,
            closer,
        } = self.connector.connect().await?;

        let ctx = AgentContext::new(agent_id, space_id, outbound, closer.clone(), self.deps.clone());
        let join = ClientMessage::Join(JoinRequest {
            space_id: space_id.to_string(),
            from_id: agent_id.to_string(),
            role: Role::Agent,
        });

        let joined = match ctx.send(join) {
            Ok(()) => tokio::time::timeout(self.options.join_timeout, wait_joined(&mut inbound))
                .await
                .unwrap_or_else(|_| {
                    Err(AppError::Timeout(format!(
                        "No joined reply for {} in {} within {:?}",
                        agent_id, space_id, self.options.join_timeout
                    )))
                }),
            Err(e) => Err(e),
        };
        let participants = match joined {
            Ok(participants) => participants,
            Err(e) => {
                closer.cancel();
                warn!("{} failed to join {}: {}", agent_id, space_id, e);
                return Err(e);
            }
        };

        ctx.set_roster(participants);
        ctx.set_state(ContextState::Joined);
        self.contexts
            .write()
            .insert((space_id.to_string(), agent_id.to_string()), ctx.clone());
        tokio::spawn(dispatch(
            self.contexts.clone(),
            ctx.clone(),
            inbound,
            self.shutdown.clone(),
        ));

        info!("Agent {} joined space {}", agent_id, space_id);
        Ok(ctx)
    }

    /// Leave `space_id`: tear down connections, stop sessions, send `leave`
    pub async fn leave_space(&self, space_id: &str, agent_id: &str) -> Result<()> {
        let ctx = self
            .contexts
            .write()
            .remove(&(space_id.to_string(), agent_id.to_string()))
            .ok_or_else(|| {
                AppError::NotFound(format!("Agent {} is not in space {}", agent_id, space_id))
            })?;

        ctx.set_state(ContextState::Leaving);
        ctx.send_leave();
        ctx.shutdown().await;
        info!("Agent {} left space {}", agent_id, space_id);
        Ok(())
    }

    /// Start a monitoring session, joining first if needed
    pub async fn start_stream_monitoring(
        &self,
        space_id: &str,
        agent_id: Option<&str>,
    ) -> Result<String> {
        let agent_id = agent_id.unwrap_or(&self.options.agent_id).to_string();

        let ctx = match self.context(space_id, &agent_id) {
            Some(ctx) if ctx.state() == ContextState::Joined => ctx,
            _ => {
                let ctx = self.join_space_as_agent(space_id, &agent_id).await?;
                // Let publishers see peer-joined before asking them
                tokio::time::sleep(self.options.stabilization).await;
                ctx
            }
        };

        let session_id = self
            .deps
            .monitor
            .start_monitoring(&agent_id, space_id)
            .await?;
        ctx.add_session(session_id.clone());

        let requested = self.request_active_streams(&ctx);
        info!(
            "Monitoring session {} started for {} in {} ({} stream(s) requested)",
            session_id, agent_id, space_id, requested
        );
        Ok(session_id)
    }

    /// Ask every publisher of an active camera or screen stream to announce again
    fn request_active_streams(&self, ctx: &AgentContext) -> usize {
        let streams: Vec<(String, StreamType)> = match &self.registry {
            Some(registry) => registry
                .get_space_streams(ctx.space_id())
                .into_iter()
                .map(|s| (s.participant_id, s.stream_type))
                .collect(),
            None => ctx.roster().iter().flat_map(roster_streams).collect(),
        };

        let mut requested = 0;
        for (peer_id, stream_type) in streams {
            if peer_id == ctx.agent_id() {
                continue;
            }
            if matches!(stream_type, StreamType::Camera | StreamType::Screen) {
                ctx.request_publish_state(&peer_id, stream_type);
                requested += 1;
            }
        }
        requested
    }

    /// Stop a monitoring session; connections stay up
    pub async fn stop_stream_monitoring(&self, session_id: &str) -> Result<()> {
        let contexts: Vec<_> = self.contexts.read().values().cloned().collect();
        let owned = contexts.iter().any(|ctx| ctx.remove_session(session_id));
        if !owned {
            debug!("Session {} not registered on any context", session_id);
        }
        self.deps.monitor.stop_monitoring(session_id).await?;
        info!("Monitoring session {} stopped", session_id);
        Ok(())
    }

    pub fn status(&self) -> BridgeStatus {
        let mut contexts: Vec<_> = self.contexts.read().values().map(|c| c.status()).collect();
        contexts.sort_by(|a, b| (&a.space_id, &a.agent_id).cmp(&(&b.space_id, &b.agent_id)));
        BridgeStatus { contexts }
    }

    /// Forward capture frames published on `events` to monitoring sessions
    pub fn spawn_capture_listener(self: &Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = bridge.shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) => bridge.forward_capture(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Capture listener lagged by {} frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Capture listener stopped");
        })
    }

    async fn forward_capture(&self, event: SpaceEvent) {
        let frame = event.frame();
        let sessions: Vec<String> = self
            .contexts
            .read()
            .values()
            .filter(|ctx| ctx.space_id() == frame.space_id)
            .flat_map(|ctx| ctx.sessions())
            .collect();
        if sessions.is_empty() {
            return;
        }

        let images = self.images.clone();
        let encoded = frame.frame.clone();
        let raw = match tokio::task::spawn_blocking(move || images.decode(&encoded)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                debug!("Capture frame from {} dropped: {}", frame.participant_id, e);
                return;
            }
            Err(e) => {
                warn!("Capture decode task failed: {}", e);
                return;
            }
        };

        let Some(rgba) = RgbaFrame::from_raw(&raw, &frame.participant_id, event.stream_type())
        else {
            return;
        };
        forward_frame(&*self.deps.monitor, &sessions, &rgba).await;
    }

    /// Leave every space and stop background tasks
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let contexts: Vec<_> = self.contexts.write().drain().map(|(_, c)| c).collect();
        for ctx in contexts {
            ctx.set_state(ContextState::Leaving);
            ctx.send_leave();
            ctx.shutdown().await;
        }
        info!("Agent bridge stopped");
    }
}

fn roster_streams(peer: &ParticipantSummary) -> Vec<(String, StreamType)> {
    let mut streams = Vec::new();
    if peer.publish_state.is_active() {
        streams.push((peer.participant_id.clone(), StreamType::Camera));
    }
    if peer.screen_sharing {
        streams.push((peer.participant_id.clone(), StreamType::Screen));
    }
    streams
}

/// Wait for the relay to acknowledge a join
async fn wait_joined(
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<Vec<ParticipantSummary>> {
    while let Some(msg) = inbound.recv().await {
        match msg {
            ServerMessage::Joined(payload) => return Ok(payload.participants),
            ServerMessage::Error(e) => {
                return Err(AppError::BadRequest(format!("Join rejected: {}", e.message)))
            }
            other => debug!("Ignoring {:?} before joined", other),
        }
    }
    Err(AppError::Transport(
        "Signaling closed before joined".to_string(),
    ))
}

/// Process one context's inbound signaling until its transport ends
async fn dispatch(
    contexts: ContextMap,
    ctx: Arc<AgentContext>,
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    shutdown: CancellationToken,
) {
    let transport = ctx.transport_token().clone();
    loop {
        let msg = tokio::select! {
            _ = transport.cancelled() => break,
            _ = shutdown.cancelled() => break,
            msg = inbound.recv() => msg,
        };
        match msg {
            Some(msg) => ctx.handle_server_message(msg).await,
            None => break,
        }
    }

    if ctx.state() != ContextState::Leaving {
        warn!(
            "Signaling for {} in {} ended, cleaning up",
            ctx.agent_id(),
            ctx.space_id()
        );
    }
    ctx.shutdown().await;

    let key = (ctx.space_id().to_string(), ctx.agent_id().to_string());
    let mut contexts = contexts.write();
    if contexts.get(&key).is_some_and(|c| Arc::ptr_eq(c, &ctx)) {
        contexts.remove(&key);
    }
}
