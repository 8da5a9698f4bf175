use std::sync::Arc;

use crate::config::RelayConfig;
use crate::signaling::SignalingHub;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Effective configuration after CLI overrides
    pub config: RelayConfig,
    /// Signaling coordinator; all relay state lives behind it
    pub hub: Arc<SignalingHub>,
}

impl AppState {
    /// Create new application state
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let hub = Arc::new(SignalingHub::new(config.signaling.clone()));
        Arc::new(Self { config, hub })
    }
}
