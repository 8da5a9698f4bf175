use serde::{Deserialize, Serialize};

/// Main relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Signaling relay settings
    pub signaling: SignalingConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
    /// Path of the signaling WebSocket endpoint
    pub ws_path: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 9003,
            bind_address: "0.0.0.0".to_string(),
            ws_path: "/p2p/ws".to_string(),
        }
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Per-connection outbound queue depth. A peer whose queue is full
    /// loses messages instead of stalling the relay.
    pub outbox_capacity: usize,
    /// Accept list subscribers without a `user_id` by assigning an
    /// anonymous identity (they get a `warning` frame instead of an `error`)
    pub allow_anonymous_subscribers: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            allow_anonymous_subscribers: false,
        }
    }
}
