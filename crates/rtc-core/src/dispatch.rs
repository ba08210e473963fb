//! Request dispatch to the external job service.
//!
//! The engine only sees the `RequestDispatcher` trait. `HttpDispatcher` is
//! the production implementation: it posts `JobInstructions` to the job
//! service and reports back the HTTP status and reason phrase.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, RtcError};

/// Event name the external service raises when calling back.
pub const CALLBACK_EVENT_NAME: &str = "Callback";

pub const BASE_URL_TOKEN: &str = "{baseUrl}";
pub const INSTANCE_ID_TOKEN: &str = "{instanceId}";
pub const EVENT_NAME_TOKEN: &str = "{eventName}";

/// Query parameter naming the attempt a callback belongs to.
pub const ATTEMPT_QUERY_PARAM: &str = "attempt";

/// Build the callback address for one instance from the URL template.
pub fn callback_uri(template: &str, base_url: &str, instance_id: &str) -> String {
    template
        .replace(BASE_URL_TOKEN, base_url.trim_end_matches('/'))
        .replace(INSTANCE_ID_TOKEN, instance_id)
        .replace(EVENT_NAME_TOKEN, CALLBACK_EVENT_NAME)
}

/// Instance callback address tagged with the attempt it answers.
pub fn attempt_callback_uri(callback_uri: &str, attempt_id: Uuid) -> String {
    let sep = if callback_uri.contains('?') { '&' } else { '?' };
    format!("{callback_uri}{sep}{ATTEMPT_QUERY_PARAM}={attempt_id}")
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub attempt_id: Uuid,
    /// Already tagged with `attempt_id`.
    pub callback_uri: String,
    pub error_likelihood_percentage: u8,
}

/// HTTP-status-like result of a dispatch plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub status: u16,
    pub reason: String,
}

impl DispatchOutcome {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Body understood by the job service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstructions {
    /// Respond with 500 instead of 200.
    pub return_error: bool,
    pub callback_uri: String,
    #[serde(default)]
    pub callback_after_milliseconds: u64,
    #[serde(default)]
    pub respond_after_milliseconds: u64,
}

// ---------------------------------------------------------------------------
// RequestDispatcher
// ---------------------------------------------------------------------------

/// Sends one request to the external service. A returned `Err` is a
/// transport fault; the engine treats it like a non-success status.
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome>;
}

// ---------------------------------------------------------------------------
// HttpDispatcher
// ---------------------------------------------------------------------------

pub struct HttpDispatcher {
    client: reqwest::Client,
    job_url: String,
    callback_after: Duration,
    respond_after: Duration,
}

impl HttpDispatcher {
    pub fn new(job_url: impl Into<String>, callback_after: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            job_url: job_url.into(),
            callback_after,
            respond_after: Duration::ZERO,
        }
    }

    pub fn with_respond_after(mut self, respond_after: Duration) -> Self {
        self.respond_after = respond_after;
        self
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.dispatch.job_url.clone(),
            Duration::from_millis(config.dispatch.callback_after_ms),
        )
        .with_respond_after(Duration::from_millis(config.dispatch.respond_after_ms))
    }

    fn instructions(&self, request: &DispatchRequest) -> JobInstructions {
        JobInstructions {
            return_error: roll_error(request.error_likelihood_percentage),
            callback_uri: request.callback_uri.clone(),
            callback_after_milliseconds: self.callback_after.as_millis() as u64,
            respond_after_milliseconds: self.respond_after.as_millis() as u64,
        }
    }
}

/// `true` with probability `percentage / 100`.
fn roll_error(percentage: u8) -> bool {
    rand::thread_rng().gen_range(0..100u8) < percentage
}

#[async_trait]
impl RequestDispatcher for HttpDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutcome> {
        let instructions = self.instructions(request);
        debug!(
            job_url = %self.job_url,
            attempt_id = %request.attempt_id,
            return_error = instructions.return_error,
            "dispatch: posting job"
        );
        let response = self
            .client
            .post(&self.job_url)
            .json(&instructions)
            .send()
            .await
            .map_err(|e| RtcError::Dispatch(e.to_string()))?;
        let status = response.status();
        let outcome = DispatchOutcome::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
        );
        info!(status = outcome.status, reason = %outcome.reason, "dispatch: job service answered");
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pct: u8) -> DispatchRequest {
        DispatchRequest {
            attempt_id: Uuid::nil(),
            callback_uri: "http://localhost:7071/api/orchestrations/abc/events/Callback".into(),
            error_likelihood_percentage: pct,
        }
    }

    #[test]
    fn callback_uri_substitutes_all_tokens() {
        let uri = callback_uri(
            "{baseUrl}/api/orchestrations/{instanceId}/events/{eventName}",
            "http://host:7071/",
            "abc-123",
        );
        assert_eq!(
            uri,
            "http://host:7071/api/orchestrations/abc-123/events/Callback"
        );
    }

    #[test]
    fn attempt_tag_is_appended_as_query() {
        let id = Uuid::nil();
        assert_eq!(
            attempt_callback_uri("http://h/api/orchestrations/a/events/Callback", id),
            format!("http://h/api/orchestrations/a/events/Callback?attempt={id}")
        );
        assert_eq!(
            attempt_callback_uri("http://h/cb?code=x", id),
            format!("http://h/cb?code=x&attempt={id}")
        );
    }

    #[test]
    fn success_is_2xx_only() {
        assert!(DispatchOutcome::new(200, "OK").is_success());
        assert!(DispatchOutcome::new(202, "Accepted").is_success());
        assert!(!DispatchOutcome::new(500, "Internal Server Error").is_success());
        assert!(!DispatchOutcome::new(404, "Not Found").is_success());
        assert!(!DispatchOutcome::new(0, "").is_success());
    }

    #[test]
    fn error_roll_respects_extremes() {
        for _ in 0..200 {
            assert!(!roll_error(0));
            assert!(roll_error(100));
        }
    }

    #[test]
    fn instructions_serialize_in_camel_case() {
        let d = HttpDispatcher::new("http://localhost/api/job", Duration::from_millis(1500));
        let json = serde_json::to_value(d.instructions(&request(100))).unwrap();
        assert_eq!(json["returnError"], true);
        assert_eq!(json["callbackAfterMilliseconds"], 1500);
        assert_eq!(json["respondAfterMilliseconds"], 0);
        assert_eq!(
            json["callbackUri"],
            "http://localhost:7071/api/orchestrations/abc/events/Callback"
        );
    }

    #[test]
    fn respond_delay_comes_from_config() {
        let mut config = crate::config::Config::default();
        config.dispatch.respond_after_ms = 3000;
        let d = HttpDispatcher::from_config(&config);
        let json = serde_json::to_value(d.instructions(&request(0))).unwrap();
        assert_eq!(json["respondAfterMilliseconds"], 3000);
        assert_eq!(json["callbackAfterMilliseconds"], 3000);
    }

    #[tokio::test]
    async fn ok_response_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/job")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "returnError": false,
                "callbackUri": "http://localhost:7071/api/orchestrations/abc/events/Callback",
            })))
            .with_status(200)
            .create_async()
            .await;

        let d = HttpDispatcher::new(format!("{}/api/job", server.url()), Duration::ZERO);
        let outcome = d.dispatch(&request(0)).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.reason, "OK");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_reported_as_non_success() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/job")
            .with_status(500)
            .create_async()
            .await;

        let d = HttpDispatcher::new(format!("{}/api/job", server.url()), Duration::ZERO);
        let outcome = d.dispatch(&request(100)).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.reason, "Internal Server Error");
    }

    #[tokio::test]
    async fn unreachable_service_is_a_dispatch_error() {
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let d = HttpDispatcher::new("http://127.0.0.1:9/api/job", Duration::ZERO);
        let err = d.dispatch(&request(0)).await.unwrap_err();
        assert!(matches!(err, RtcError::Dispatch(_)), "{err}");
    }
}
