use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Signaling relay settings
    pub signaling: SignalingConfig,
    /// Agent media bridge settings
    pub bridge: BridgeConfig,
    /// ICE server settings used by the bridge's peer connections
    pub webrtc: WebRtcConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Require space membership (or public auto-enrollment) on join
    pub enforce_membership: bool,
    /// WebSocket heartbeat interval in seconds
    pub heartbeat_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            enforce_membership: true,
            heartbeat_secs: 30,
        }
    }
}

/// Agent media bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Remote signaling endpoint (ws:// or wss://). When unset the bridge
    /// attaches to this process's registry directly.
    pub signaling_url: Option<String>,
    /// How long to wait for `joined` after emitting `join`
    pub join_timeout_ms: u64,
    /// Pause after an implicit join before requesting publish state
    pub stabilization_ms: u64,
    /// Participant id used when a request names no agent
    pub agent_id: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            signaling_url: None,
            join_timeout_ms: 10_000,
            stabilization_ms: 1_000,
            agent_id: "spacelink-agent".to_string(),
        }
    }
}

/// WebRTC ICE configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g. `turn:turn.example.com:3478?transport=udp`)
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"bridge": {"join_timeout_ms": 2500}}"#).unwrap();
        assert_eq!(config.bridge.join_timeout_ms, 2500);
        assert_eq!(config.bridge.stabilization_ms, 1_000);
        assert_eq!(config.web.http_port, 8080);
        assert!(config.signaling.enforce_membership);
    }
}
