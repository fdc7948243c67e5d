//! Concrete saga definitions.
//!
//! - **`project`** — provisioning and deletion of a project namespace
//! - **`workload`** — deployment, update and deletion of a Helm release

pub mod project;
pub mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kubemanager_cluster::{ClusterProvisioner, HelmInstaller};
use kubemanager_saga::StepProfiles;
use kubemanager_state::StateStore;
use uuid::Uuid;

use crate::admission::AdmissionGate;
use crate::rbac::RbacService;

pub const PROJECT_CREATE: &str = "project.create";
pub const PROJECT_DELETE: &str = "project.delete";
pub const WORKLOAD_DEPLOY: &str = "workload.deploy";
pub const WORKLOAD_UPDATE: &str = "workload.update";
pub const WORKLOAD_DELETE: &str = "workload.delete";

/// Fresh saga id of the form `<kind>-<uuid>`.
pub fn new_saga_id(kind: &str) -> String {
    format!("{kind}-{}", Uuid::new_v4())
}

/// Chart every workload is installed from.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSettings {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    /// Helm `--wait` timeout.
    pub timeout: Duration,
}

/// Collaborators shared by every step.
#[derive(Clone)]
pub struct SagaDeps {
    pub store: StateStore,
    pub cluster: Arc<dyn ClusterProvisioner>,
    pub helm: Arc<dyn HelmInstaller>,
    pub rbac: Arc<dyn RbacService>,
    pub gate: AdmissionGate,
    pub profiles: StepProfiles,
    pub chart: ChartSettings,
    /// Address embedded in generated ingress hosts.
    pub public_address: String,
}
