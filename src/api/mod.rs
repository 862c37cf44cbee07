// REST API endpoints for the orchestrator

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::{ExecutionRequest, ExecutionResult};
use crate::error::OrchestratorError;
use crate::handoff::{HandoffRequest, HandoffResponse};
use crate::orchestrator::Orchestrator;
use crate::schema::JsonObject;
use crate::types::{CapsuleName, FileName, SessionId};
use crate::workflow::{WorkflowDefinition, WorkflowRunResult};

/// The orchestrator is internally synchronized, so handlers share it
/// without a lock and nested handoffs never wait on their caller's request.
pub type AppState = Arc<Orchestrator>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/capsules", get(list_capsules))
        .route("/capsules/{name}/schema", get(capsule_schema))
        .route("/execute", post(execute))
        .route("/handoff", post(handoff))
        .route("/workflows/run", post(run_workflow))
        .route("/state", get(state_snapshot))
        .route("/visualizer", get(visualizer))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Error body used for requests rejected outright.
fn error_response(err: &OrchestratorError) -> Response {
    (
        err.status_code(),
        Json(serde_json::json!({
            "success": false,
            "error": err.to_string(),
        })),
    )
        .into_response()
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn list_capsules(State(state): State<AppState>) -> Json<Value> {
    let capsules = state.registry().list();
    Json(serde_json::json!({
        "capsules": capsules,
        "count": capsules.len(),
    }))
}

/// Raw input/output schema of a capsule, used by translator capsules.
async fn capsule_schema(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry().get(&name) {
        Ok(def) => Json(&def.schema_document).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    capsule: CapsuleName,
    #[serde(default)]
    input: JsonObject,
    #[serde(default)]
    files: BTreeMap<FileName, PathBuf>,
}

async fn execute(State(state): State<AppState>, Json(body): Json<ExecuteBody>) -> Response {
    let mut request = ExecutionRequest::new(body.capsule, body.input);
    request.files = body.files;

    let result = state.execute(request).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status_code(),
    };
    (status, Json(ExecutionResult::from(result))).into_response()
}

#[derive(Debug, Deserialize)]
struct HandoffBody {
    session_id: SessionId,
    #[serde(flatten)]
    request: HandoffRequest,
}

/// Called by running units. Failures the caller should react to are returned
/// as `success: false` with 200; only a broken correlation is an HTTP error.
async fn handoff(State(state): State<AppState>, Json(body): Json<HandoffBody>) -> Response {
    let result = state.handoff(&body.session_id, body.request).await;
    let status = match &result {
        Err(e @ (OrchestratorError::UnknownSession(_) | OrchestratorError::HandoffInFlight(_))) => {
            e.status_code()
        }
        _ => StatusCode::OK,
    };
    (status, Json(HandoffResponse::from(result))).into_response()
}

#[derive(Debug, Deserialize)]
struct WorkflowBody {
    workflow: WorkflowDefinition,
    #[serde(default)]
    input: JsonObject,
}

async fn run_workflow(State(state): State<AppState>, Json(body): Json<WorkflowBody>) -> Response {
    match state.run_workflow(&body.workflow, body.input).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => (e.status_code(), Json(WorkflowRunResult::rejected(&e))).into_response(),
    }
}

async fn state_snapshot(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.tracker().snapshot()).unwrap_or(Value::Null))
}

/// Static page that polls `/state` and renders executions, handoffs and workflows.
async fn visualizer() -> Html<&'static str> {
    Html(include_str!("visualizer.html"))
}
