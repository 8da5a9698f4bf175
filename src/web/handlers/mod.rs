use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::signaling::{BroadcastStats, BroadcastSummary, ServerStatus};
use crate::state::AppState;

// ============================================================================
// Health
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Broadcasts
// ============================================================================

/// Successful API response envelope
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            count: None,
            data,
        }
    }
}

/// List live broadcasts
pub async fn list_broadcasts(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<BroadcastSummary>>> {
    let broadcasts = state.hub.list_active();
    Json(ApiResponse {
        success: true,
        count: Some(broadcasts.len()),
        data: broadcasts,
    })
}

/// Viewers and counters for one broadcast
pub async fn broadcast_stats(
    State(state): State<Arc<AppState>>,
    Path(broadcaster_id): Path<String>,
) -> Result<Json<ApiResponse<BroadcastStats>>> {
    let stats = state.hub.broadcast_stats(&broadcaster_id)?;
    Ok(Json(ApiResponse::ok(stats)))
}

/// Aggregate relay status
pub async fn server_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ServerStatus>> {
    Json(ApiResponse::ok(state.hub.status()))
}
