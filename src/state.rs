use std::sync::Arc;
use tokio::sync::broadcast;

use crate::bridge::AgentBridge;
use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::signaling::SpaceRegistry;

/// Application-wide state shared across handlers
///
/// Built once at startup; the registry and bridge are the only owners of
/// space and agent state.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Signaling registry
    pub registry: Arc<SpaceRegistry>,
    /// Agent media bridge
    pub bridge: Arc<AgentBridge>,
    /// Capture frames published by signaling sessions
    pub events: Arc<EventBus>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        config: ConfigStore,
        registry: Arc<SpaceRegistry>,
        bridge: Arc<AgentBridge>,
        events: Arc<EventBus>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            bridge,
            events,
            shutdown_tx,
        })
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
