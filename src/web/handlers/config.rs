//! Runtime configuration of the signaling relay

use axum::{extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::SignalingConfig;
use crate::error::{AppError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SignalingConfigUpdate {
    pub enforce_membership: Option<bool>,
    pub heartbeat_secs: Option<u64>,
}

impl SignalingConfigUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.heartbeat_secs {
            if !(1..=3600).contains(&secs) {
                return Err(AppError::BadRequest(
                    "Invalid heartbeat_secs: must be 1-3600".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut SignalingConfig) {
        if let Some(enforce) = self.enforce_membership {
            config.enforce_membership = enforce;
        }
        if let Some(secs) = self.heartbeat_secs {
            config.heartbeat_secs = secs;
        }
    }
}

pub async fn get_signaling_config(State(state): State<Arc<AppState>>) -> Json<SignalingConfig> {
    Json(state.config.get().signaling.clone())
}

/// Update signaling settings; sockets opened afterwards use the new values
pub async fn update_signaling_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignalingConfigUpdate>,
) -> Result<Json<SignalingConfig>> {
    req.validate()?;

    state
        .config
        .update(|config| {
            req.apply_to(&mut config.signaling);
        })
        .await?;

    Ok(Json(state.config.get().signaling.clone()))
}
