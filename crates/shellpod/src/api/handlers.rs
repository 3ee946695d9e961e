//! Session HTTP handlers.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Serialize;
use shellpod_protocol::{
    ActivitySnapshot, GetIdentityResponse, HealthPayload, SetIdentityRequest, SetIdentityResponse,
};
use tracing::{info, instrument};

use crate::lifecycle::StatusSnapshot;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Server liveness.
#[derive(Debug, Serialize)]
pub struct ServerHealth {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Json<ServerHealth> {
    Json(ServerHealth {
        status: "ok",
        version: state.version,
    })
}

/// Bind a session to its storage bucket. Sent once by the provisioning path.
#[instrument(skip(state, body))]
pub async fn set_identity(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<SetIdentityRequest>, JsonRejection>,
) -> ApiResult<Json<SetIdentityResponse>> {
    let Json(request) = body.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let bucket = request
        .bucket_identifier
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("bucketIdentifier is required"))?;

    let stored = state.session(&session_id)?.set_identity(bucket).await?;
    info!(bucket = %stored, "Identity set");
    Ok(Json(SetIdentityResponse {
        success: true,
        bucket_identifier: stored,
    }))
}

#[instrument(skip(state))]
pub async fn get_identity(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<GetIdentityResponse>> {
    let bucket_identifier = state.session(&session_id)?.get_identity().await?;
    Ok(Json(GetIdentityResponse { bucket_identifier }))
}

/// Container health, proxied through the session's circuit breaker.
#[instrument(skip(state))]
pub async fn session_health(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<HealthPayload>> {
    let health = state.session(&session_id)?.health().await?;
    Ok(Json(health))
}

#[instrument(skip(state))]
pub async fn session_activity(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ActivitySnapshot>> {
    let snapshot = state.session(&session_id)?.activity().await?;
    Ok(Json(snapshot))
}

/// Start the container if needed and wait until it is healthy.
#[instrument(skip(state))]
pub async fn start_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusSnapshot>> {
    let status = state.session(&session_id)?.ensure_started().await?;
    info!(endpoint = ?status.endpoint, "Session started");
    Ok(Json(status))
}

#[instrument(skip(state))]
pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusSnapshot>> {
    let status = state.session(&session_id)?.status().await?;
    Ok(Json(status))
}

/// Destroy the session. Repeating the call is harmless.
#[instrument(skip(state))]
pub async fn destroy_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.session(&session_id)?.destroy().await?;
    // The next request starts from the tombstone and clears it.
    state.registry.evict(&session_id);
    info!("Session destroyed");
    Ok(StatusCode::NO_CONTENT)
}
