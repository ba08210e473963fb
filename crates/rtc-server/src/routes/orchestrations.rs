use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rtc_core::attempt::{AttemptCounters, AttemptRecord};
use rtc_core::callback::Delivery;
use rtc_core::checkpoint::Step;
use rtc_core::dispatch::CALLBACK_EVENT_NAME;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/orchestrations — start a new instance.
///
/// Returns 202 as soon as the instance is recorded; the run continues in
/// the background and its progress is visible through the status URI.
pub async fn start_orchestration(
    State(app): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let started = app.engine.start().await?;
    let status_uri = format!("{}/api/orchestrations/{}", app.base_url(), started.instance_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "id": started.instance_id,
            "status_uri": status_uri,
            "callback_uri": started.callback_uri,
        })),
    ))
}

/// GET /api/orchestrations — ids of every known instance.
pub async fn list_orchestrations(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ids = app.engine.list_instances().await?;
    Ok(Json(serde_json::json!({ "instances": ids })))
}

#[derive(Serialize)]
struct StatusBody<'a> {
    instance_id: &'a str,
    overall_state: &'a str,
    attempts: Vec<&'a AttemptRecord>,
    counters: AttemptCounters,
    step: Option<&'a Step>,
    running: bool,
}

/// GET /api/orchestrations/{id} — ledger snapshot, derived counters and the
/// run's current step.
pub async fn get_orchestration(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = app.engine.status(&id).await?;
    let body = StatusBody {
        instance_id: &status.state.instance_id,
        overall_state: &status.state.overall_state,
        attempts: status.state.attempts_chronological(),
        counters: status.counters,
        step: status.step.as_ref(),
        running: status.running,
    };
    Ok(Json(serde_json::to_value(body)?))
}

/// Accepts `true`/`false` in any case, optionally JSON-quoted.
pub(crate) fn parse_callback_body(body: &str) -> Option<bool> {
    let value = body.trim().trim_matches('"').trim();
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    attempt: Option<String>,
}

/// POST /api/orchestrations/{id}/events/{event}[?attempt=..] — external
/// callback.
///
/// 202 when an outstanding wait was resolved, 200 `{"delivered": false}`
/// when nothing was waiting (late, duplicate or unknown instance) or the
/// callback belongs to another attempt (`"stale": true`).
pub async fn raise_event(
    State(app): State<AppState>,
    Path((id, event)): Path<(String, String)>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Result<Response, AppError> {
    if !event.eq_ignore_ascii_case(CALLBACK_EVENT_NAME) {
        return Err(AppError::not_found(format!("unknown event '{event}'")));
    }
    let success = parse_callback_body(&body).ok_or_else(|| {
        AppError::bad_request(format!(
            "callback body must be true or false, got '{}'",
            body.trim()
        ))
    })?;

    let attempt_id = query
        .attempt
        .as_deref()
        .map(|raw| {
            Uuid::parse_str(raw)
                .map_err(|_| AppError::bad_request(format!("invalid attempt id '{raw}'")))
        })
        .transpose()?;

    let response = match app.engine.deliver_callback(&id, attempt_id, success) {
        Delivery::Resolved => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "delivered": true })),
        ),
        Delivery::NoWaiter => (
            StatusCode::OK,
            Json(serde_json::json!({ "delivered": false })),
        ),
        Delivery::Stale => (
            StatusCode::OK,
            Json(serde_json::json!({ "delivered": false, "stale": true })),
        ),
    };
    Ok(response.into_response())
}

/// POST /api/orchestrations/{id}/reset — clear the attempt ledger.
pub async fn reset_orchestration(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.engine.reset(&id).await?;
    Ok(Json(serde_json::json!({ "id": id, "reset": true })))
}

/// DELETE /api/orchestrations/{id} — remove the record and its checkpoint.
pub async fn delete_orchestration(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.engine.delete(&id).await?;
    Ok(Json(serde_json::json!({ "id": id, "deleted": true })))
}
