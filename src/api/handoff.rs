//! QR handoff endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::handoff::{HandoffEntry, HandoffError};

use super::routes::AppState;
use super::types::{HandoffCreated, HandoffRequest};

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HandoffRequest>,
) -> Result<(StatusCode, Json<HandoffCreated>), (StatusCode, String)> {
    let entry = state.handoff.insert(req.payload).await.map_err(|err| {
        let status = match err {
            HandoffError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            HandoffError::Empty => StatusCode::BAD_REQUEST,
        };
        (status, err.to_string())
    })?;

    tracing::debug!(id = %entry.id, "Handoff stored");
    Ok((
        StatusCode::CREATED,
        Json(HandoffCreated {
            id: entry.id,
            expires_at: entry.expires_at,
        }),
    ))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<HandoffEntry>, (StatusCode, String)> {
    state
        .handoff
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Handoff not found or expired".to_string()))
}
