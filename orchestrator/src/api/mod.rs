use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared_types::{EnsureWorkerRequest, EnsureWorkerResponse, RecordRequestBody};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::{identity::WorkerIdentity, workers::SupervisorError, AppState};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/workers", get(list_workers))
        .route("/admin/workers/ensure", post(ensure_worker))
        .route("/admin/workers/stop-all", post(stop_all_workers))
        .route("/admin/workers/{identity}/stop", post(stop_worker))
        .route("/admin/workers/{identity}/requests", post(record_request))
        .route("/admin/tenants/{tenant_id}/stop", post(stop_tenant))
        .route("/admin/ports", get(port_status))
        .route("/admin/ports/cleanup", post(cleanup_ports))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /admin/workers: workers grouped by tenant
async fn list_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.status())
}

/// POST /admin/workers/ensure
async fn ensure_worker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnsureWorkerRequest>,
) -> Response {
    match state
        .supervisor
        .ensure_running(&req.task_name, &req.tenant)
        .await
    {
        Ok(endpoint) => Json(EnsureWorkerResponse {
            identity: endpoint.identity.to_string(),
            port: endpoint.port,
            outcome: endpoint.outcome,
        })
        .into_response(),
        Err(e) => supervisor_error_response(e),
    }
}

/// POST /admin/workers/{identity}/stop
async fn stop_worker(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Response {
    let Some(identity) = WorkerIdentity::parse(&identity) else {
        return (StatusCode::BAD_REQUEST, "identity must look like Name@tenant").into_response();
    };
    if state.supervisor.stop(&identity).await {
        StatusCode::OK.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// POST /admin/workers/{identity}/requests
async fn record_request(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    Json(body): Json<RecordRequestBody>,
) -> Response {
    let Some(identity) = WorkerIdentity::parse(&identity) else {
        return (StatusCode::BAD_REQUEST, "identity must look like Name@tenant").into_response();
    };
    if state
        .supervisor
        .record_request(&identity, body.response_time_ms, body.is_error)
    {
        StatusCode::ACCEPTED.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// POST /admin/tenants/{tenant_id}/stop
async fn stop_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    Json(state.supervisor.stop_all_for_tenant(&tenant_id).await)
}

/// POST /admin/workers/stop-all
async fn stop_all_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.stop_all().await)
}

/// GET /admin/ports
async fn port_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.allocator.status().await)
}

/// POST /admin/ports/cleanup
async fn cleanup_ports(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reclaimed = state.allocator.cleanup_stale().await;
    Json(serde_json::json!({ "reclaimed": reclaimed }))
}

fn supervisor_error_response(e: SupervisorError) -> Response {
    let (status, body) = match &e {
        SupervisorError::Exhausted { identity, source } => {
            let crate::ports::AllocatorError::Exhausted {
                range_start,
                range_end,
                allocated,
                pending,
            } = source;
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": "exhausted",
                    "identity": identity,
                    "range_start": range_start,
                    "range_end": range_end,
                    "allocated": allocated,
                    "pending": pending,
                }),
            )
        }
        SupervisorError::WorkerSpawnFailed { identity, port, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({
                "error": "worker_spawn_failed",
                "identity": identity,
                "port": port,
            }),
        ),
        SupervisorError::WorkerUnresponsive {
            identity,
            port,
            timeout_ms,
        } => (
            StatusCode::GATEWAY_TIMEOUT,
            serde_json::json!({
                "error": "worker_unresponsive",
                "identity": identity,
                "port": port,
                "timeout_ms": timeout_ms,
            }),
        ),
    };

    if status == StatusCode::GATEWAY_TIMEOUT {
        warn!("ensure worker: {e}");
    } else {
        error!("ensure worker: {e}");
    }

    let mut body = body;
    body["message"] = serde_json::Value::String(e.to_string());
    (status, Json(body)).into_response()
}
