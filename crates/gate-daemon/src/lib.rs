// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-daemon
#![deny(unsafe_code)]
//!
//! The §6 HTTP control-plane API: an axum router over a single shared
//! [`Orchestrator`], translating its plan/approve/commit/revert operations
//! into the `/bundles` route family and mapping [`GateError`]/[`CommitError`]
//! into the status codes and error bodies §6/§7 specify.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gate_error::{ErrorCategory, ErrorCode, GateError};
use gate_orchestrator::{CommitError, Orchestrator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shared daemon state: one process-wide [`Orchestrator`].
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// Build the axum router with every `/bundles` route plus `/health`.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bundles", post(ingest_bundle).get(list_bundles))
        .route("/bundles/{id}/plan", get(plan_bundle))
        .route("/bundles/{id}/approve", post(approve_bundle))
        .route("/bundles/{id}/commit", post(commit_bundle))
        .route("/bundles/{id}/revert", post(revert_bundle))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The wire shape of an error response: a stable code, a message, and the
/// sorted reason list §7 promises ("the API reports an error code and
/// sorted reason list").
#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasons: Option<Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    context: BTreeMap<String, Value>,
}

struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn context_kind(error: &GateError) -> Option<&str> {
    error.context().get("kind").and_then(Value::as_str)
}

fn status_for(error: &GateError) -> StatusCode {
    match context_kind(error) {
        Some("BundleNotFound") => return StatusCode::NOT_FOUND,
        Some("NothingToRevert") => return StatusCode::BAD_REQUEST,
        Some("AlreadyCommitted") => return StatusCode::CONFLICT,
        _ => {}
    }
    match error.code() {
        ErrorCode::ApprovalRequired | ErrorCode::PolicyDenied => StatusCode::FORBIDDEN,
        ErrorCode::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::HttpError => StatusCode::BAD_GATEWAY,
        _ => match error.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Policy => StatusCode::FORBIDDEN,
            ErrorCategory::Journal | ErrorCategory::Driver | ErrorCategory::Replay | ErrorCategory::Io => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
    }
}

impl From<GateError> for ApiError {
    fn from(error: GateError) -> Self {
        let status = status_for(&error);
        let reasons = error.reasons();
        let mut context = error.context().clone();
        context.remove("kind");
        context.remove("reasons");
        Self {
            status,
            body: ApiErrorBody {
                error: error.code().as_str().to_string(),
                message: error.message().to_string(),
                reasons: if reasons.is_empty() { None } else { Some(reasons) },
                context,
            },
        }
    }
}

impl From<CommitError> for ApiError {
    fn from(error: CommitError) -> Self {
        error.error.into()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        body: ApiErrorBody { error: "INVALID_REQUEST".to_string(), message: message.into(), reasons: None, context: BTreeMap::new() },
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    #[serde(rename = "bundleId")]
    bundle_id: String,
}

async fn ingest_bundle(State(state): State<Arc<AppState>>, body: axum::body::Bytes) -> Result<impl IntoResponse, ApiError> {
    if body.is_empty() {
        return Err(bad_request("request body must not be empty"));
    }
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &body).unwrap_or_else(|_| body.to_vec());
    let bundle_id = state.orchestrator.ingest(bytes).await?;
    Ok((StatusCode::CREATED, Json(IngestResponse { bundle_id })))
}

#[derive(Debug, Serialize)]
struct BundleListEntry {
    id: String,
    #[serde(rename = "createdAt")]
    created_at: chrono::DateTime<chrono::Utc>,
    status: gate_core::BundleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    approval: Option<gate_core::ApprovalRecord>,
}

async fn list_bundles(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let summaries = state.orchestrator.list_bundles().await?;
    let mut bundles = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let status = state.orchestrator.status(&summary.id).await?;
        bundles.push(BundleListEntry {
            id: summary.id,
            created_at: summary.created_at,
            status: status.state,
            approval: status.approval,
        });
    }
    Ok(Json(serde_json::json!({ "bundles": bundles })))
}

#[derive(Debug, Serialize)]
struct PlanResponse {
    #[serde(rename = "bundleId")]
    bundle_id: String,
    intents: Vec<gate_orchestrator::PlannedIntent>,
    policy: gate_policy::Evaluation,
}

async fn plan_bundle(State(state): State<Arc<AppState>>, AxPath(id): AxPath<String>) -> Result<impl IntoResponse, ApiError> {
    let plan = state.orchestrator.plan(&id).await?;
    Ok(Json(PlanResponse { bundle_id: plan.bundle_id, intents: plan.intents, policy: plan.evaluation }))
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    actor: Option<String>,
    #[serde(rename = "policyVersion")]
    #[allow(dead_code)]
    policy_version: Option<String>,
}

async fn approve_bundle(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    Json(req): Json<ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = req.actor.filter(|a| !a.trim().is_empty()).ok_or_else(|| bad_request("actor is required"))?;
    let approval = state.orchestrator.approve(&id, actor).await?;
    Ok(Json(serde_json::json!({ "status": "approved", "bundleId": id, "approval": approval })))
}

async fn commit_bundle(State(state): State<Arc<AppState>>, AxPath(id): AxPath<String>) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.orchestrator.commit(&id).await.map_err(ApiError::from)?;
    let receipts: Vec<Value> = outcome
        .receipts
        .into_iter()
        .map(|r| serde_json::json!({ "intentId": r.intent_id, "receipt": r.receipt }))
        .collect();
    Ok(Json(serde_json::json!({ "status": "committed", "receipts": receipts })))
}

async fn revert_bundle(State(state): State<Arc<AppState>>, AxPath(id): AxPath<String>) -> Result<impl IntoResponse, ApiError> {
    let outcomes = state.orchestrator.revert(&id).await?;
    Ok(Json(serde_json::json!({ "status": "reverted", "outcomes": outcomes })))
}
