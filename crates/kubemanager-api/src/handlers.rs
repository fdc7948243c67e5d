//! REST API handlers.
//!
//! Each handler delegates to the `Provisioner` and wraps the answer in the
//! `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use kubemanager_provision::{
    Accepted, CreateProjectRequest, DeployWorkloadRequest, ProvisionError, UpdateWorkloadRequest,
};
use kubemanager_state::{SagaRecord, SagaStatus, StepLogEntry};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::{ApiState, USER_ID_HEADER};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn status_for(err: &ProvisionError) -> StatusCode {
    match err {
        ProvisionError::Validation(_) | ProvisionError::Unsupported(_) => StatusCode::BAD_REQUEST,
        ProvisionError::NotFound(_) => StatusCode::NOT_FOUND,
        ProvisionError::Conflict(_) => StatusCode::CONFLICT,
        ProvisionError::QuotaExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn provision_error(err: ProvisionError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    error_response(&err.to_string(), status)
}

fn respond<T: Serialize>(result: Result<T, ProvisionError>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => provision_error(e),
    }
}

fn accepted<H>(result: Result<(Accepted, H), ProvisionError>) -> Response {
    // The saga keeps running once its handle is dropped.
    match result {
        Ok((accepted, _handle)) => (StatusCode::ACCEPTED, ApiResponse::ok(accepted)).into_response(),
        Err(e) => provision_error(e),
    }
}

fn owner_from(headers: &HeaderMap) -> Result<Uuid, Response> {
    let raw = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            error_response(
                &format!("missing {USER_ID_HEADER} header"),
                StatusCode::BAD_REQUEST,
            )
        })?;
    Uuid::parse_str(raw.trim()).map_err(|_| {
        error_response(
            &format!("{USER_ID_HEADER} must be a UUID"),
            StatusCode::BAD_REQUEST,
        )
    })
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

// ── Projects ───────────────────────────────────────────────────

/// GET /api/v1/projects
pub async fn list_projects(State(state): State<ApiState>) -> Response {
    respond(state.provisioner.list_projects())
}

/// POST /api/v1/projects
pub async fn create_project(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Response {
    let owner = match owner_from(&headers) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    accepted(state.provisioner.create_project(req, owner))
}

/// DELETE /api/v1/projects/{id}
pub async fn delete_project(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    accepted(state.provisioner.delete_project(&id))
}

/// GET /api/v1/projects/{id}/status
pub async fn project_status(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    respond(state.provisioner.get_status(&id).await)
}

/// GET /api/v1/projects/{id}/metrics
pub async fn project_metrics(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    respond(state.provisioner.get_metrics(&id).await)
}

/// GET /api/v1/projects/{id}/workloads
pub async fn list_workloads(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    respond(state.provisioner.list_workloads(&id))
}

// ── Workloads ──────────────────────────────────────────────────

/// POST /api/v1/workloads
pub async fn deploy_workload(
    State(state): State<ApiState>,
    Json(req): Json<DeployWorkloadRequest>,
) -> Response {
    accepted(state.provisioner.deploy_workload(req).await)
}

/// GET /api/v1/workloads/{id}
pub async fn get_workload(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    respond(state.provisioner.get_workload(&id))
}

/// PATCH /api/v1/workloads/{id}
pub async fn update_workload(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWorkloadRequest>,
) -> Response {
    accepted(state.provisioner.update_workload(&id, req).await)
}

/// DELETE /api/v1/workloads/{id}
pub async fn delete_workload(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    accepted(state.provisioner.delete_workload(&id))
}

// ── Sagas ──────────────────────────────────────────────────────

/// Saga progress as exposed over HTTP. The context is left out: it can
/// carry secret values.
#[derive(Debug, Serialize)]
pub struct SagaView {
    pub id: String,
    pub kind: String,
    pub correlation_id: String,
    pub status: SagaStatus,
    pub phase: Option<String>,
    pub current_step: Option<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub steps: Vec<StepLogEntry>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<SagaRecord> for SagaView {
    fn from(record: SagaRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            correlation_id: record.correlation_id,
            status: record.status,
            phase: record.phase,
            current_step: record.current_step,
            failed_step: record.failed_step,
            error: record.error,
            steps: record.steps,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// GET /api/v1/sagas/{id}
pub async fn saga_status(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.provisioner.saga_status(&id).map(SagaView::from))
}

/// POST /api/v1/sagas/{id}/cancel
pub async fn cancel_saga(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(
        state
            .provisioner
            .cancel_saga(&id)
            .map(|()| serde_json::json!({ "saga_id": id, "cancel_requested": true })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (ProvisionError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ProvisionError::Unsupported("x".into()), StatusCode::BAD_REQUEST),
            (ProvisionError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ProvisionError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ProvisionError::QuotaExceeded {
                    resource: "cpu".into(),
                    requested: "2000m".into(),
                    limit: "1000m".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ProvisionError::Task("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{err}");
        }
    }

    #[test]
    fn owner_header_must_be_uuid() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            owner_from(&headers).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );

        headers.insert(USER_ID_HEADER, "alice".parse().unwrap());
        assert_eq!(
            owner_from(&headers).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );

        let id = Uuid::new_v4();
        headers.insert(USER_ID_HEADER, id.to_string().parse().unwrap());
        assert_eq!(owner_from(&headers).unwrap(), id);
    }

    #[test]
    fn saga_view_omits_context() {
        let record = SagaRecord::new(
            "workload.deploy-1",
            "workload.deploy",
            "w1",
            &["ensure_secret"],
            serde_json::json!({ "secrets": { "TOKEN": "s3cret" } }),
        );
        let json = serde_json::to_string(&SagaView::from(record)).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(json.contains("ensure_secret"));
    }
}
