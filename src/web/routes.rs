use axum::{
    routing::{any, get, patch, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let space_routes = Router::new()
        .route("/spaces/:space_id/peers", get(handlers::space_peers))
        .route("/spaces/:space_id/streams", get(handlers::space_streams));

    let bridge_routes = Router::new()
        .route("/bridge/join", post(handlers::bridge_join))
        .route("/bridge/leave", post(handlers::bridge_leave))
        .route("/bridge/monitoring/start", post(handlers::monitoring_start))
        .route("/bridge/monitoring/stop", post(handlers::monitoring_stop))
        .route("/bridge/status", get(handlers::bridge_status));

    let config_routes = Router::new()
        .route("/config/signaling", get(handlers::config::get_signaling_config))
        .route(
            "/config/signaling",
            patch(handlers::config::update_signaling_config),
        );

    let api_routes = Router::new()
        .merge(space_routes)
        .merge(bridge_routes)
        .merge(config_routes);

    Router::new()
        .route("/health", get(handlers::health_check))
        // Signaling WebSocket
        .route("/ws", any(ws_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
