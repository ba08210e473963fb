use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rtc_core::error::RtcError;

// ---------------------------------------------------------------------------
// Internal sentinels for explicit statuses
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP status through the `anyhow::Error` chain for
/// request-level problems that have no `RtcError` counterpart.
#[derive(Debug)]
struct StatusError {
    status: StatusCode,
    message: String,
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StatusError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn with_status(status: StatusCode, msg: impl Into<String>) -> Self {
        Self(
            StatusError {
                status,
                message: msg.into(),
            }
            .into(),
        )
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, msg)
    }
}

fn status_for(err: &RtcError) -> StatusCode {
    match err {
        RtcError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        RtcError::InstanceExists(_) | RtcError::InstanceBusy(_) | RtcError::Faulted { .. } => {
            StatusCode::CONFLICT
        }
        RtcError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        RtcError::Dispatch(_) => StatusCode::BAD_GATEWAY,
        RtcError::UnknownAttempt { .. }
        | RtcError::DuplicateAttemptId { .. }
        | RtcError::Store(_)
        | RtcError::Io(_)
        | RtcError::Yaml(_)
        | RtcError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if let Some(s) = self.0.downcast_ref::<StatusError>() {
            s.status
        } else if let Some(e) = self.0.downcast_ref::<RtcError>() {
            status_for(e)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
