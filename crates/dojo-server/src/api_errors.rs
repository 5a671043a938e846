//! HTTP error mapping for session handlers.
//!
//! Every error leaves the server as
//! `{ "requestId": ..., "error": { "code", "message", "details" } }`.
//! `code` is the stable [`RuntimeError::category`] string; `details` carries the
//! session id and status whenever the error is scoped to a session.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dojo_runtime::RuntimeError;
use metrics::counter;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::metrics::HTTP_ERRORS_TOTAL;

/// An error ready to be rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    request_id: String,
    error: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            request_id: None,
        }
    }

    /// 422 for a body or query the handler could not use.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_request", message)
    }

    /// 500 for failures outside the session engine.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    /// Attach a caller-supplied request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// HTTP status this error renders with.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        self.code
    }
}

fn status_for(error: &RuntimeError) -> StatusCode {
    match error {
        RuntimeError::NotFound { .. } | RuntimeError::WorkshopNotFound(_) => StatusCode::NOT_FOUND,
        RuntimeError::InvalidState { .. } | RuntimeError::Busy { .. } => StatusCode::CONFLICT,
        RuntimeError::InvalidStep { .. } | RuntimeError::InvalidRequest(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        RuntimeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RuntimeError::Provision { .. } | RuntimeError::Execution { .. } => StatusCode::BAD_GATEWAY,
        RuntimeError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn details_for(error: &RuntimeError) -> Option<Value> {
    let mut details = Map::new();
    if let Some(id) = error.session_id() {
        let _ = details.insert("sessionId".into(), json!(id));
    }
    if let Some(status) = error.status() {
        let _ = details.insert("status".into(), json!(status));
    }
    match error {
        RuntimeError::InvalidStep {
            expected, requested, ..
        } => {
            let _ = details.insert("expectedStepId".into(), json!(expected));
            let _ = details.insert("requestedStepId".into(), json!(requested));
        }
        RuntimeError::Timeout { timeout_ms, .. } => {
            let _ = details.insert("timeoutMs".into(), json!(timeout_ms));
        }
        RuntimeError::WorkshopNotFound(id) => {
            let _ = details.insert("workshopId".into(), json!(id));
        }
        _ => {}
    }
    let _ = details.insert("recoverable".into(), json!(error.is_recoverable()));
    Some(Value::Object(details))
}

impl From<RuntimeError> for ApiError {
    fn from(error: RuntimeError) -> Self {
        Self {
            status: status_for(&error),
            code: error.category(),
            message: error.to_string(),
            details: details_for(&error),
            request_id: None,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        counter!(HTTP_ERRORS_TOTAL, "code" => self.code).increment(1);
        let request_id = self
            .request_id
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let body = ErrorEnvelope {
            request_id,
            error: ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dojo_core::ids::{SessionId, StepId, WorkshopId};
    use dojo_core::session::SessionStatus;

    async fn render(error: ApiError) -> (StatusCode, Value) {
        let resp = error.into_response();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn status_mapping() {
        let sid = || SessionId::from("s1");
        let cases = [
            (RuntimeError::NotFound { session_id: sid() }, StatusCode::NOT_FOUND),
            (
                RuntimeError::WorkshopNotFound(WorkshopId::from("w")),
                StatusCode::NOT_FOUND,
            ),
            (
                RuntimeError::InvalidState {
                    session_id: sid(),
                    status: SessionStatus::Expired,
                },
                StatusCode::CONFLICT,
            ),
            (
                RuntimeError::Busy {
                    session_id: sid(),
                    status: SessionStatus::Active,
                },
                StatusCode::CONFLICT,
            ),
            (
                RuntimeError::InvalidRequest("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                RuntimeError::Timeout {
                    session_id: sid(),
                    status: SessionStatus::Active,
                    timeout_ms: 10,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                RuntimeError::Provision {
                    session_id: sid(),
                    message: "no capacity".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                RuntimeError::CapacityExceeded { limit: 1 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status(), expected);
        }
    }

    #[tokio::test]
    async fn envelope_carries_session_context() {
        let (status, body) = render(ApiError::from(RuntimeError::InvalidStep {
            session_id: SessionId::from("s1"),
            status: SessionStatus::Active,
            expected: Some(StepId::from("b")),
            requested: StepId::from("c"),
        }))
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["requestId"].is_string());
        assert_eq!(body["error"]["code"], "invalid_step");
        assert_eq!(body["error"]["details"]["sessionId"], "s1");
        assert_eq!(body["error"]["details"]["status"], "active");
        assert_eq!(body["error"]["details"]["expectedStepId"], "b");
        assert_eq!(body["error"]["details"]["recoverable"], false);
    }

    #[tokio::test]
    async fn request_id_is_kept() {
        let (_, body) = render(ApiError::internal("boom").with_request_id("req-1")).await;
        assert_eq!(body["requestId"], "req-1");
        assert_eq!(body["error"]["code"], "internal");
        assert!(body["error"].get("details").is_none());
    }
}
