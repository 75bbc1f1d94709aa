use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::bridge::BridgeStatus;
use crate::error::Result;
use crate::signaling::{DetailedStream, ParticipantSummary};
use crate::state::AppState;

pub mod config;

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
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
// Spaces
// ============================================================================

pub async fn space_peers(
    State(state): State<Arc<AppState>>,
    Path(space_id): Path<String>,
) -> Json<Vec<ParticipantSummary>> {
    Json(state.registry.get_peers(&space_id))
}

/// Active streams of a space with participant identity
pub async fn space_streams(
    State(state): State<Arc<AppState>>,
    Path(space_id): Path<String>,
) -> Json<Vec<DetailedStream>> {
    Json(state.registry.get_detailed_space_streams(&space_id))
}

// ============================================================================
// Agent bridge
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpaceRequest {
    pub space_id: String,
    /// Defaults to the configured bridge agent id
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub success: bool,
    pub space_id: String,
    pub agent_id: String,
    pub participants: Vec<ParticipantSummary>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn bridge_join(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AgentSpaceRequest>,
) -> Result<Json<JoinResponse>> {
    let agent_id = req
        .agent_id
        .unwrap_or_else(|| state.bridge.default_agent_id().to_string());
    let ctx = state
        .bridge
        .join_space_as_agent(&req.space_id, &agent_id)
        .await?;

    Ok(Json(JoinResponse {
        success: true,
        space_id: req.space_id,
        agent_id,
        participants: ctx.roster(),
    }))
}

pub async fn bridge_leave(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AgentSpaceRequest>,
) -> Result<Json<SuccessResponse>> {
    let agent_id = req
        .agent_id
        .unwrap_or_else(|| state.bridge.default_agent_id().to_string());
    state.bridge.leave_space(&req.space_id, &agent_id).await?;

    Ok(Json(SuccessResponse {
        success: true,
        message: Some(format!("{} left {}", agent_id, req.space_id)),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStarted {
    pub success: bool,
    pub session_id: String,
}

pub async fn monitoring_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AgentSpaceRequest>,
) -> Result<Json<MonitoringStarted>> {
    let session_id = state
        .bridge
        .start_stream_monitoring(&req.space_id, req.agent_id.as_deref())
        .await?;

    Ok(Json(MonitoringStarted {
        success: true,
        session_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStopRequest {
    pub session_id: String,
}

pub async fn monitoring_stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MonitoringStopRequest>,
) -> Result<Json<SuccessResponse>> {
    state.bridge.stop_stream_monitoring(&req.session_id).await?;
    Ok(Json(SuccessResponse {
        success: true,
        message: None,
    }))
}

pub async fn bridge_status(State(state): State<Arc<AppState>>) -> Json<BridgeStatus> {
    Json(state.bridge.status())
}
