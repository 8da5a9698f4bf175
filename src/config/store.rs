use std::path::Path;

use super::RelayConfig;
use crate::error::{AppError, Result};

/// Load configuration from a JSON file
///
/// `None` yields the built-in defaults. Fields missing from the file fall
/// back to their defaults as well.
pub async fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    let Some(path) = path else {
        return Ok(RelayConfig::default());
    };

    let raw = tokio::fs::read_to_string(path).await?;
    let config: RelayConfig = serde_json::from_str(&raw)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;

    if config.signaling.outbox_capacity == 0 {
        return Err(AppError::Config(
            "signaling.outbox_capacity must be greater than zero".to_string(),
        ));
    }

    if !config.web.ws_path.starts_with('/') || config.web.ws_path.starts_with("/api/") {
        return Err(AppError::Config(format!(
            "web.ws_path must be an absolute path outside /api: {}",
            config.web.ws_path
        )));
    }

    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
