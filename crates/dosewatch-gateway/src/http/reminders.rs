//! Reminder CRUD and per-reminder adherence reads under `/users/{owner_id}/reminders`.
//!
//! `owner_id` is trusted: callers are authenticated upstream.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use dosewatch_core::{OwnerId, ReminderId};
use dosewatch_scheduler::{AdherenceRecord, MissedDose, Reminder, ReminderInput};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::error::ApiError;
use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

fn parse_input(body: Value) -> Result<ReminderInput, ApiError> {
    serde_json::from_value(body).map_err(ApiError::invalid_body)
}

/// POST /users/{owner_id}/reminders
pub async fn create_reminder(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Reminder>), ApiError> {
    let input = parse_input(body)?;
    let reminder = state.store.create(&OwnerId(owner_id), input, Utc::now())?;
    Ok((StatusCode::CREATED, Json(reminder)))
}

/// GET /users/{owner_id}/reminders?page=&limit=
///
/// Ordered by next fire time (nothing pending last), then newest first.
pub async fn list_reminders(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let api = &state.config.api;
    let limit = q
        .limit
        .unwrap_or(api.default_page_size)
        .clamp(1, api.max_page_size.max(1));
    let page = q.page.unwrap_or(1).max(1);

    let result = state.store.list_for_owner(&OwnerId(owner_id), page, limit)?;
    Ok(Json(json!({
        "reminders": result.items,
        "pagination": {
            "total": result.total,
            "page": result.page,
            "limit": result.limit,
            "total_pages": result.total_pages(),
        },
    })))
}

/// PUT /users/{owner_id}/reminders/{id}
pub async fn update_reminder(
    State(state): State<Arc<AppState>>,
    Path((owner_id, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Reminder>, ApiError> {
    let owner = OwnerId(owner_id);
    let id = ReminderId(id);
    // Ownership is checked before the body so foreign ids are always 404.
    state.store.get_for_owner(&owner, &id)?;
    let input = parse_input(body)?;
    let reminder = state.store.update(&owner, &id, input, Utc::now())?;
    Ok(Json(reminder))
}

/// DELETE /users/{owner_id}/reminders/{id}
pub async fn delete_reminder(
    State(state): State<Arc<AppState>>,
    Path((owner_id, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete(&OwnerId(owner_id), &ReminderId(id.clone()))?;
    info!(reminder_id = %id, "reminder deleted via API");
    Ok(Json(json!({ "message": "Reminder deleted successfully" })))
}

/// GET /users/{owner_id}/reminders/missed
pub async fn missed_reminders(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> Result<Json<Vec<MissedDose>>, ApiError> {
    let missed = state
        .tracker
        .missed_for_owner(&OwnerId(owner_id), Utc::now())?;
    Ok(Json(missed))
}

/// GET /users/{owner_id}/reminders/{id}/history
pub async fn reminder_history(
    State(state): State<Arc<AppState>>,
    Path((owner_id, id)): Path<(String, String)>,
) -> Result<Json<Vec<AdherenceRecord>>, ApiError> {
    let records = state
        .tracker
        .history(&OwnerId(owner_id), &ReminderId(id))?;
    Ok(Json(records))
}
