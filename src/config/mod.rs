//! Persistent application configuration

mod schema;
mod store;

pub use schema::{AppConfig, BridgeConfig, SignalingConfig, TurnServer, WebConfig, WebRtcConfig};
pub use store::ConfigStore;
