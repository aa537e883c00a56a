use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use dosewatch_core::OwnerId;
use dosewatch_scheduler::AdherenceRecord;
use serde::Deserialize;

use super::error::ApiError;
use crate::app::AppState;

#[derive(Debug, Default, Deserialize)]
struct TakenBody {
    taken_at: Option<DateTime<Utc>>,
}

/// POST /users/{owner_id}/adherence/{record_id}/taken
///
/// Optional body `{"taken_at": "..."}`; defaults to now.
pub async fn mark_taken(
    State(state): State<Arc<AppState>>,
    Path((owner_id, record_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<AdherenceRecord>, ApiError> {
    let parsed: TakenBody = if body.is_empty() {
        TakenBody::default()
    } else {
        serde_json::from_slice(&body).map_err(ApiError::invalid_body)?
    };
    let taken_at = parsed.taken_at.unwrap_or_else(Utc::now);
    let record = state
        .store
        .mark_taken(&OwnerId(owner_id), &record_id, taken_at)?;
    Ok(Json(record))
}

/// POST /users/{owner_id}/adherence/{record_id}/skipped
pub async fn mark_skipped(
    State(state): State<Arc<AppState>>,
    Path((owner_id, record_id)): Path<(String, String)>,
) -> Result<Json<AdherenceRecord>, ApiError> {
    let record = state.store.mark_skipped(&OwnerId(owner_id), &record_id)?;
    Ok(Json(record))
}
