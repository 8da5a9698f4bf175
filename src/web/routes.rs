use axum::{
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::signaling_ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Read-only query surface
    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/broadcasts", get(handlers::list_broadcasts))
        .route("/broadcasts/:broadcaster_id", get(handlers::broadcast_stats))
        .route("/status", get(handlers::server_status));

    Router::new()
        .route(&state.config.web.ws_path, any(signaling_ws_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
