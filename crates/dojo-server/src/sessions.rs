//! Session route handlers.
//!
//! Thin translation between JSON bodies and [`SessionManager`] calls; every
//! rule lives in the runtime.
//!
//! [`SessionManager`]: dojo_runtime::SessionManager

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dojo_core::ids::{SessionId, StepId, UserId, WorkshopId};
use dojo_core::session::{SessionSnapshot, SessionStatus};
use dojo_runtime::{ExecutionResult, NewSession, ValidationOutcome};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::api_errors::ApiError;
use crate::metrics::HTTP_REQUESTS_TOTAL;
use crate::server::AppState;

/// `POST /sessions` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Workshop to attempt.
    pub workshop_id: WorkshopId,
    /// Requesting user.
    pub user_id: UserId,
}

/// `POST /sessions` response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    /// New or resumed session.
    pub session_id: SessionId,
    /// Status after creation.
    pub status: SessionStatus,
    /// Whether an existing live session was returned instead of a new one.
    pub resumed: bool,
    /// Full snapshot.
    pub snapshot: SessionSnapshot,
}

/// `POST /sessions/{id}/execute` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Shell command to run.
    pub command: String,
    /// Optional timeout; zero or absent means the configured default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `POST /sessions/{id}/validate` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    /// Step to validate.
    pub step_id: StepId,
}

/// `DELETE /sessions/{id}` query.
#[derive(Debug, Default, Deserialize)]
pub struct EndQuery {
    /// Recorded end reason.
    pub reason: Option<String>,
}

fn count(route: &'static str) {
    counter!(HTTP_REQUESTS_TOTAL, "route" => route).increment(1);
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    count("create_session");
    let Json(body) = body?;
    let workshop = state.catalog.workshop(&body.workshop_id)?;
    let request = NewSession::for_workshop(&workshop, body.user_id);
    let (snapshot, created) = state.manager.create_or_resume(request).await?;
    debug!(session_id = %snapshot.session.id, created, "create session handled");

    let code = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let body = CreateSessionResponse {
        session_id: snapshot.session.id.clone(),
        status: snapshot.session.status,
        resumed: !created,
        snapshot,
    };
    Ok((code, Json(body)).into_response())
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    count("get_session");
    Ok(Json(state.manager.get_status(&id).await?))
}

/// POST /sessions/{id}/execute
pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>, ApiError> {
    count("execute");
    let Json(body) = body?;
    let timeout = body.timeout_ms.map(Duration::from_millis);
    Ok(Json(state.manager.execute(&id, &body.command, timeout).await?))
}

/// POST /sessions/{id}/validate
pub async fn validate(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    body: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<Json<ValidationOutcome>, ApiError> {
    count("validate");
    let Json(body) = body?;
    Ok(Json(state.manager.validate_step(&id, &body.step_id).await?))
}

/// DELETE /sessions/{id}
pub async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    query: Result<Query<EndQuery>, QueryRejection>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    count("end_session");
    let Query(query) = query?;
    Ok(Json(
        state
            .manager
            .end_session(&id, query.reason.as_deref())
            .await?,
    ))
}
