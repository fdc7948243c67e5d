//! kubemanager-api — REST API for KubeManager.
//!
//! Launching endpoints answer `202 Accepted` with the saga id as soon as
//! the saga is started; callers poll the status endpoints.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/projects` | List projects |
//! | POST | `/api/v1/projects` | Create a project (owner from `x-user-id`) |
//! | DELETE | `/api/v1/projects/{id}` | Delete a project |
//! | GET | `/api/v1/projects/{id}/status` | Status, phase and namespace |
//! | GET | `/api/v1/projects/{id}/metrics` | Live usage and reservations |
//! | GET | `/api/v1/projects/{id}/workloads` | List workloads |
//! | POST | `/api/v1/workloads` | Admit and deploy a workload |
//! | GET | `/api/v1/workloads/{id}` | Workload details |
//! | PATCH | `/api/v1/workloads/{id}` | Update a workload |
//! | DELETE | `/api/v1/workloads/{id}` | Delete a workload |
//! | GET | `/api/v1/sagas/{id}` | Saga progress |
//! | POST | `/api/v1/sagas/{id}/cancel` | Request saga cancellation |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use kubemanager_provision::Provisioner;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub provisioner: Provisioner,
}

/// Build the complete API router.
pub fn build_router(provisioner: Provisioner) -> Router {
    let state = ApiState { provisioner };

    let api_routes = Router::new()
        .route(
            "/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route("/projects/{id}", axum::routing::delete(handlers::delete_project))
        .route("/projects/{id}/status", get(handlers::project_status))
        .route("/projects/{id}/metrics", get(handlers::project_metrics))
        .route("/projects/{id}/workloads", get(handlers::list_workloads))
        .route("/workloads", post(handlers::deploy_workload))
        .route(
            "/workloads/{id}",
            get(handlers::get_workload)
                .patch(handlers::update_workload)
                .delete(handlers::delete_workload),
        )
        .route("/sagas/{id}", get(handlers::saga_status))
        .route("/sagas/{id}/cancel", post(handlers::cancel_saga))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
