//! KubeManager provisioning.
//!
//! Turns tenant requests into saga runs against the state store, the
//! cluster and Helm:
//!
//! ```text
//!   request ──► admission (workloads) ──► saga engine ──► steps
//!                    │                                     │
//!              quota accountant                 store / cluster / helm
//! ```
//!
//! # Components
//!
//! - **`quota`** — Exact-unit reservation math and per-project totals
//! - **`admission`** — Per-project serialized quota check
//! - **`rbac`** — Role binding collaborator
//! - **`sagas`** — Project and workload saga definitions
//! - **`provisioner`** — Facade: launch, query, cancel, recover

pub mod admission;
pub mod error;
pub mod provisioner;
pub mod quota;
pub mod rbac;
pub mod request;
pub mod sagas;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use error::{ProvisionError, ProvisionResult};
pub use provisioner::{ProvisionSettings, Provisioner, SagaHandle};
pub use quota::{QuotaAccountant, ResourceUsage};
pub use rbac::{RbacService, StoreRbac};
pub use request::{
    Accepted, CreateProjectRequest, DeployWorkloadRequest, ProjectMetrics, ProjectStatusView,
    ReservedResources, UpdateWorkloadRequest,
};
