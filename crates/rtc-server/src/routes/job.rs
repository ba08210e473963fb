use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tracing::{info, warn};

use rtc_core::dispatch::JobInstructions;

use crate::state::AppState;

/// POST /api/job — simulated external job service.
///
/// Answers 500 when told to fail. Otherwise answers 200 and, after
/// `callbackAfterMilliseconds`, posts `true` to the callback URI. Only
/// mounted when the server runs with the simulator enabled.
pub async fn simulate_job(
    State(app): State<AppState>,
    Json(job): Json<JobInstructions>,
) -> StatusCode {
    if job.respond_after_milliseconds > 0 {
        tokio::time::sleep(Duration::from_millis(job.respond_after_milliseconds)).await;
    }

    if job.return_error {
        warn!(callback_uri = %job.callback_uri, "job simulator: failing request as instructed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    let client = app.http.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(job.callback_after_milliseconds)).await;
        let result = client
            .post(&job.callback_uri)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body("true")
            .send()
            .await;
        match result {
            Ok(resp) => info!(
                callback_uri = %job.callback_uri,
                status = resp.status().as_u16(),
                "job simulator: callback sent"
            ),
            Err(e) => warn!(
                callback_uri = %job.callback_uri,
                error = %e,
                "job simulator: callback failed"
            ),
        }
    });

    StatusCode::OK
}
