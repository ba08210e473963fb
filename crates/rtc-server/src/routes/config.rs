use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/config — the configuration the server was started with, plus
/// any validation warnings.
///
/// Read-only. Changes go through `rtc.yaml` and a restart.
pub async fn get_config(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let mut json = serde_json::to_value(&*app.config)?;
    let warnings = serde_json::to_value(app.config.validate())?;
    if let Some(obj) = json.as_object_mut() {
        obj.insert("warnings".into(), warnings);
    }
    Ok(Json(json))
}
